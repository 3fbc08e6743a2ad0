use crate::error::VrError;
use crate::vocab::{Vocab, END_TOKEN, NULL_TOKEN, SCENE_TOKEN, START_TOKEN};

/// A program tree; `scene` leaves read the image features of the current sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramNode {
    pub function: usize,
    pub inputs: Vec<ProgramNode>,
}

impl ProgramNode {
    pub fn leaf(function: usize) -> Self {
        Self { function, inputs: Vec::new() }
    }

    pub fn num_nodes(&self) -> usize {
        1 + self.inputs.iter().map(ProgramNode::num_nodes).sum::<usize>()
    }
}

/// Program tokens and arities, indexed by program token id.
#[derive(Debug, Clone)]
pub struct FunctionTable {
    tokens: Vec<String>,
    arity: Vec<usize>,
    scene: usize,
}

impl FunctionTable {
    pub fn from_vocab(vocab: &Vocab) -> Result<Self, VrError> {
        let tokens = vocab.program_idx_to_token();
        let arity = tokens
            .iter()
            .map(|t| vocab.program_token_arity.get(t).copied().unwrap_or(0))
            .collect();
        let scene = vocab
            .program_token_to_idx
            .get(SCENE_TOKEN)
            .copied()
            .ok_or_else(|| VrError::UnknownToken(SCENE_TOKEN.to_string()))? as usize;
        Ok(Self { tokens, arity, scene })
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn scene(&self) -> usize {
        self.scene
    }

    pub fn token(&self, function: usize) -> &str {
        &self.tokens[function]
    }

    pub fn arity(&self, function: usize) -> usize {
        self.arity[function]
    }

    /// Tokens that never name a module.
    pub fn is_special(&self, function: usize) -> bool {
        matches!(self.tokens[function].as_str(), NULL_TOKEN | START_TOKEN | END_TOKEN)
    }

    /// Parses a prefix-encoded program into a tree.
    ///
    /// Positions past the end of `tokens`, `<NULL>` and `<END>` stand for an
    /// implicit `scene`; `<START>` is skipped.
    pub fn parse_prefix(&self, tokens: &[i64]) -> Result<ProgramNode, VrError> {
        let (node, _) = self.parse_from(tokens, 0)?;
        Ok(node)
    }

    fn parse_from(&self, tokens: &[i64], mut pos: usize) -> Result<(ProgramNode, usize), VrError> {
        loop {
            let Some(&raw) = tokens.get(pos) else {
                return Ok((ProgramNode::leaf(self.scene), pos + 1));
            };
            let function = self.lookup(raw)?;
            pos += 1;
            match self.tokens[function].as_str() {
                START_TOKEN => continue,
                NULL_TOKEN | END_TOKEN => return Ok((ProgramNode::leaf(self.scene), pos)),
                _ => {}
            }
            if function == self.scene {
                return Ok((ProgramNode::leaf(function), pos));
            }
            let arity = self.arity[function];
            if arity == 0 || arity > 2 {
                return Err(VrError::UnsupportedArity {
                    token: self.tokens[function].clone(),
                    arity,
                });
            }
            let mut inputs = Vec::with_capacity(arity);
            while inputs.len() < arity {
                let (child, next) = self.parse_from(tokens, pos)?;
                inputs.push(child);
                pos = next;
            }
            return Ok((ProgramNode { function, inputs }, pos));
        }
    }

    fn lookup(&self, raw: i64) -> Result<usize, VrError> {
        if raw < 0 || raw as usize >= self.tokens.len() {
            return Err(VrError::UnknownTokenIndex { index: raw, size: self.tokens.len() });
        }
        Ok(raw as usize)
    }

    /// Renders a tree back to prefix tokens, for logging.
    pub fn to_prefix_string(&self, node: &ProgramNode) -> String {
        let mut out = Vec::new();
        self.push_prefix(node, &mut out);
        out.join(" ")
    }

    fn push_prefix<'a>(&'a self, node: &ProgramNode, out: &mut Vec<&'a str>) {
        out.push(&self.tokens[node.function]);
        for input in &node.inputs {
            self.push_prefix(input, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::tests::flat_vocab;

    fn table() -> FunctionTable {
        FunctionTable::from_vocab(&flat_vocab()).unwrap()
    }

    #[test]
    fn test_parse_flat_program() {
        let table = table();
        // <START> And square scene red scene <END>
        let program = [1, 4, 8, 3, 6, 3, 2];
        let tree = table.parse_prefix(&program).unwrap();

        assert_eq!(table.token(tree.function), "And");
        assert_eq!(tree.inputs.len(), 2);
        assert_eq!(table.token(tree.inputs[0].function), "square");
        assert_eq!(table.token(tree.inputs[1].function), "red");
        assert_eq!(tree.num_nodes(), 5);
        assert_eq!(table.to_prefix_string(&tree), "And square scene red scene");
    }

    #[test]
    fn test_padding_and_truncation_become_scene() {
        let table = table();
        // `red` followed by padding
        let padded = table.parse_prefix(&[1, 6, 0, 0]).unwrap();
        assert_eq!(padded.inputs, vec![ProgramNode::leaf(table.scene())]);

        // `And blue` runs off the end: both missing inputs are implicit scenes
        let truncated = table.parse_prefix(&[4, 5]).unwrap();
        assert_eq!(truncated.inputs[0].inputs, vec![ProgramNode::leaf(table.scene())]);
        assert_eq!(truncated.inputs[1], ProgramNode::leaf(table.scene()));
    }

    #[test]
    fn test_empty_program_is_scene() {
        let table = table();
        assert_eq!(table.parse_prefix(&[]).unwrap(), ProgramNode::leaf(table.scene()));
    }

    #[test]
    fn test_unknown_index_rejected() {
        let table = table();
        assert!(matches!(
            table.parse_prefix(&[1, 42]),
            Err(VrError::UnknownTokenIndex { index: 42, .. })
        ));
    }

    #[test]
    fn test_zero_arity_function_rejected() {
        let mut vocab = flat_vocab();
        vocab.program_token_arity.insert("red".to_string(), 0);
        let table = FunctionTable::from_vocab(&vocab).unwrap();
        assert!(matches!(
            table.parse_prefix(&[6, 3]),
            Err(VrError::UnsupportedArity { arity: 0, .. })
        ));
    }
}
