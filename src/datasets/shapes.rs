//! SHAPES preprocessing.
//!
//! A SHAPES split `{prefix}` consists of `{prefix}.input.npy` (uint8 images,
//! `[N, H, W, 3]`), `{prefix}.query_str.txt` (one question per line),
//! `{prefix}.query` (one s-expression query per line) and `{prefix}.output`
//! (`true`/`false` per line). Queries become module layouts such as
//! `_Answer(_And(_Transform[above](_Find[red]), _Find[circle]))`, flattened to
//! prefix order with a `scene` input after every `_Find`.

use anyhow::{ensure, Context, Result};
use clap::ValueEnum;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::info;

use super::{write_split, VOCAB_FILE};
use crate::data::{FeatureStore, IntMatrix, QuestionStore};
use crate::error::VrError;
use crate::utils::{parse_sexp, read_npy, Sexp};
use crate::vocab::{build_token_index, Vocab, END_TOKEN, SCENE_TOKEN, START_TOKEN};

const SPATIAL_RELATIONS: [&str; 4] = ["above", "below", "left_of", "right_of"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProgramType {
    /// Questions only
    None,
    Chain,
    Tree,
}

/// A module applied to the layouts of its inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub module: String,
    pub inputs: Vec<Layout>,
}

impl Layout {
    fn leaf(module: String) -> Self {
        Self {
            module,
            inputs: Vec::new(),
        }
    }
}

pub fn layout_from_parsing(parse: &Sexp) -> Result<Layout, VrError> {
    let items = match parse {
        Sexp::Atom(word) => return Ok(Layout::leaf(format!("_Find[{}]", word))),
        Sexp::List(items) => items,
    };
    let head = items
        .first()
        .and_then(Sexp::as_atom)
        .ok_or_else(|| VrError::Sexp(format!("query '{}' has no head word", parse)))?;

    let below = match items.len() {
        2 => layout_from_parsing(&items[1])?,
        // two arguments fuse with _And
        3 => Layout {
            module: "_And".to_string(),
            inputs: vec![layout_from_parsing(&items[1])?, layout_from_parsing(&items[2])?],
        },
        n => {
            return Err(VrError::Sexp(format!(
                "'{}' takes one or two arguments, got {}",
                head,
                n.saturating_sub(1)
            )))
        }
    };

    let module = if head == "is" {
        "_Answer".to_string()
    } else if SPATIAL_RELATIONS.contains(&head) {
        format!("_Transform[{}]", head)
    } else {
        return Err(VrError::Sexp(format!("unknown query word '{}'", head)));
    };
    Ok(Layout {
        module,
        inputs: vec![below],
    })
}

/// Prefix order: each module precedes its inputs.
pub fn flatten_layout(layout: &Layout) -> Vec<String> {
    let mut out = vec![layout.module.clone()];
    for input in &layout.inputs {
        out.extend(flatten_layout(input));
    }
    out
}

/// Program tokens of one query line, wrapped in `<START>`/`<END>`.
pub fn program_tokens(query: &str) -> Result<Vec<String>, VrError> {
    let layout = layout_from_parsing(&parse_sexp(query)?)?;
    let mut program = vec![START_TOKEN.to_string()];
    for token in flatten_layout(&layout) {
        let is_find = token.starts_with("_Find");
        program.push(token);
        if is_find {
            program.push(SCENE_TOKEN.to_string());
        }
    }
    program.push(END_TOKEN.to_string());
    Ok(program)
}

pub fn arity(token: &str) -> usize {
    if token.starts_with("_And") {
        2
    } else if token == SCENE_TOKEN {
        0
    } else {
        1
    }
}

pub type ModuleText = BTreeMap<String, (Option<String>, Option<String>)>;

/// Split module tokens into module and text parts: `_Find[blue]` -> (`find`, `blue`).
///
/// Returns the per-token split and dense indices for module and text words.
pub fn vocab_to_module_text(
    program_vocab: &BTreeMap<String, i64>,
) -> (ModuleText, BTreeMap<String, i64>, BTreeMap<String, i64>) {
    let mut module_text = BTreeMap::new();
    let mut modules = BTreeSet::new();
    let mut texts = BTreeSet::new();

    for token in program_vocab.keys() {
        let entry = match token.strip_prefix('_') {
            Some(rest) => {
                let (module, text) = match rest.split_once('[') {
                    Some((module, text)) => {
                        let text = text.trim_end_matches(']').to_lowercase();
                        (module.to_lowercase(), Some(text))
                    }
                    None => (rest.to_lowercase(), None),
                };
                modules.insert(module.clone());
                if let Some(text) = &text {
                    texts.insert(text.clone());
                }
                (Some(module), text)
            }
            None => (None, None),
        };
        module_text.insert(token.clone(), entry);
    }

    let index = |set: BTreeSet<String>| set.into_iter().zip(0..).collect::<BTreeMap<_, _>>();
    (module_text, index(modules), index(texts))
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    Ok(text.lines().map(str::to_string).collect())
}

fn encode(sequences: &[Vec<String>], index: &BTreeMap<String, i64>) -> Result<IntMatrix, VrError> {
    let rows = sequences
        .iter()
        .map(|seq| {
            seq.iter()
                .map(|w| index.get(w).copied().ok_or_else(|| VrError::UnknownToken(w.clone())))
                .collect::<Result<Vec<_>, _>>()
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(IntMatrix::from_rows(&rows))
}

/// `[N, H, W, 3]` uint8 to `[N, 3, H, W]` floats in `[0, 1]`.
fn images_to_features(shape: &[usize], pixels: &[u8]) -> Result<FeatureStore, VrError> {
    let &[n, h, w, c] = shape else {
        return Err(VrError::Shape(format!("expected [N, H, W, C] images, got {:?}", shape)));
    };
    let mut data = vec![0f32; pixels.len()];
    for i in 0..n {
        for y in 0..h {
            for x in 0..w {
                for ch in 0..c {
                    let src = ((i * h + y) * w + x) * c + ch;
                    let dst = ((i * c + ch) * h + y) * w + x;
                    data[dst] = f32::from(pixels[src]) / 255.0;
                }
            }
        }
    }
    FeatureStore::new([n, c, h, w], data)
}

/// Convert the `train.{size}`, `val` and `test` splits under `shapes_data` into
/// stores in `out_dir`. Vocabularies come from the training split.
pub fn preprocess(shapes_data: &Path, size: &str, program_type: ProgramType, out_dir: &Path) -> Result<Vocab> {
    let splits = [
        ("train", format!("train.{}", size)),
        ("val", "val".to_string()),
        ("test", "test".to_string()),
    ];
    let mut vocab: Option<Vocab> = None;

    for (part, prefix) in &splits {
        let file = |suffix: &str| shapes_data.join(format!("{}.{}", prefix, suffix));
        info!("Processing {} split from {:?}", part, file("*"));

        let (shape, pixels) = read_npy(&file("input.npy"))?.into_u8()?;
        let features = images_to_features(&shape, &pixels)?;

        let questions: Vec<Vec<String>> = read_lines(&file("query_str.txt"))?
            .iter()
            .map(|q| q.split_whitespace().map(str::to_string).collect())
            .collect();
        let programs = read_lines(&file("query"))?
            .iter()
            .map(|q| program_tokens(q))
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("Bad query in {:?}", file("query")))?;
        let answers: Vec<i64> = read_lines(&file("output"))?
            .iter()
            .map(|a| i64::from(a.trim() == "true"))
            .collect();

        ensure!(
            questions.len() == programs.len()
                && questions.len() == answers.len()
                && questions.len() == features.num_images(),
            "{} split has {} questions, {} queries, {} answers and {} images",
            part,
            questions.len(),
            programs.len(),
            answers.len(),
            features.num_images()
        );

        let vocab = vocab.get_or_insert_with(|| build_vocab(&questions, &programs));
        let store = QuestionStore {
            questions: encode(&questions, &vocab.question_token_to_idx)?,
            programs: match program_type {
                ProgramType::None => None,
                ProgramType::Chain | ProgramType::Tree => {
                    Some(encode(&programs, &vocab.program_token_to_idx)?)
                }
            },
            image_idxs: (0..answers.len() as i64).collect(),
            answers,
        };
        write_split(out_dir, part, &features, &store)?;
    }

    let vocab = vocab.context("no splits processed")?;
    vocab.save(&out_dir.join(VOCAB_FILE))?;
    info!(
        "Vocabulary: {} question tokens, {} program tokens",
        vocab.question_token_to_idx.len(),
        vocab.program_token_to_idx.len()
    );
    Ok(vocab)
}

fn build_vocab(questions: &[Vec<String>], programs: &[Vec<String>]) -> Vocab {
    let program_token_to_idx = build_token_index(programs);
    let (module_text, modules, texts) = vocab_to_module_text(&program_token_to_idx);
    Vocab {
        question_token_to_idx: build_token_index(questions),
        program_token_arity: program_token_to_idx
            .keys()
            .map(|t| (t.clone(), arity(t)))
            .collect(),
        program_token_to_idx,
        answer_token_to_idx: [("false".to_string(), 0), ("true".to_string(), 1)]
            .into_iter()
            .collect(),
        program_token_to_module_text: Some(module_text),
        module_token_to_idx: Some(modules),
        text_token_to_idx: Some(texts),
    }
}
