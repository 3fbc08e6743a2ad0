//! FlatQA: synthetic "is there a <color> <shape>" questions about scenes of
//! flat coloured objects.
//!
//! Answers alternate between yes and no. A positive question picks an object
//! present in the scene; a negative one samples an absent (shape, color) pair.
//! Object filters restrict which objects may appear in scenes and be asked
//! about, which produces the compositional generalization splits.

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use image::RgbImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Instant;
use tracing::info;

use super::render::{blit, image_to_features, object_bitmap, COLORS, MIN_OBJECT_SIZE, SHAPES};
use super::{write_split, VOCAB_FILE};
use crate::data::{FeatureStore, IntMatrix, QuestionStore};
use crate::vocab::{Vocab, END_TOKEN, NULL_TOKEN, SCENE_TOKEN, START_TOKEN};

pub const OBJECTS_PER_SCENE: usize = 5;
const PLACEMENT_ATTEMPTS: usize = 10;
const MAX_PLACEMENT_FAILURES: usize = 10;
const MAX_SCENE_RESTARTS: usize = 1000;
const NEGATIVE_ATTEMPTS: usize = 11;
/// Scenes drawn per requested example before giving up on a filter.
const MAX_SCENES_PER_EXAMPLE: usize = 1000;
/// Scene layouts are shared across splits; only the questions depend on the split seed.
const SCENE_SEED: u64 = 1;

/// Why an object is being considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Generate,
    Ask,
}

pub trait ObjectFilter {
    fn allowed(&self, shape: &str, color: &str, purpose: Purpose) -> bool;
}

pub struct AllowAll;

impl ObjectFilter for AllowAll {
    fn allowed(&self, _shape: &str, _color: &str, _purpose: Purpose) -> bool {
        true
    }
}

/// Squares and triangles only come in their own colour sets. The test variant
/// only asks about squares and triangles.
pub struct CoGenT {
    square_colors: &'static [&'static str],
    triangle_colors: &'static [&'static str],
    test: bool,
}

const COGENT_SET_A: [&str; 4] = ["gray", "blue", "brown", "yellow"];
const COGENT_SET_B: [&str; 4] = ["red", "green", "purple", "cyan"];

impl CoGenT {
    pub fn train() -> Self {
        Self {
            square_colors: &COGENT_SET_A,
            triangle_colors: &COGENT_SET_B,
            test: false,
        }
    }

    pub fn test() -> Self {
        Self {
            square_colors: &COGENT_SET_B,
            triangle_colors: &COGENT_SET_A,
            test: true,
        }
    }
}

impl ObjectFilter for CoGenT {
    fn allowed(&self, shape: &str, color: &str, purpose: Purpose) -> bool {
        match shape {
            "square" => self.square_colors.contains(&color),
            "triangle" => self.triangle_colors.contains(&color),
            _ => !self.test || purpose == Purpose::Generate,
        }
    }
}

/// Objects whose shape and colour share an index are held out of training.
pub struct Diagonal {
    test: bool,
}

impl ObjectFilter for Diagonal {
    fn allowed(&self, shape: &str, color: &str, purpose: Purpose) -> bool {
        let shape_idx = SHAPES.iter().position(|s| *s == shape);
        let color_idx = COLORS.iter().position(|(c, _)| *c == color);
        let diagonal = shape_idx.is_some() && shape_idx == color_idx;
        if self.test {
            purpose == Purpose::Generate || diagonal
        } else {
            !diagonal
        }
    }
}

/// Red squares are held out; `inverse` asks about nothing else.
pub struct LeaveOneOut {
    inverse: bool,
    restrict_scene: bool,
}

impl ObjectFilter for LeaveOneOut {
    fn allowed(&self, shape: &str, color: &str, purpose: Purpose) -> bool {
        if !self.restrict_scene && purpose == Purpose::Generate {
            return true;
        }
        let red_square = shape == "square" && color == "red";
        red_square == self.inverse
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Split {
    None,
    #[value(name = "CoGenT")]
    CoGenT,
    Diagonal,
    #[value(name = "leave1out")]
    LeaveOneOut,
}

impl Split {
    /// Filters for the training split and for the val/test splits.
    pub fn filters(self, restrict_scene: bool) -> (Box<dyn ObjectFilter>, Box<dyn ObjectFilter>) {
        match self {
            Split::None => (Box::new(AllowAll), Box::new(AllowAll)),
            Split::CoGenT => (Box::new(CoGenT::train()), Box::new(CoGenT::test())),
            Split::Diagonal => (Box::new(Diagonal { test: false }), Box::new(Diagonal { test: true })),
            Split::LeaveOneOut => (
                Box::new(LeaveOneOut {
                    inverse: false,
                    restrict_scene,
                }),
                Box::new(LeaveOneOut {
                    inverse: true,
                    restrict_scene: false,
                }),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneObject {
    pub pos: (i64, i64),
    pub size: u32,
    pub shape: String,
    pub color: String,
}

pub struct SceneGenerator<'a> {
    size: u32,
    num_objects: usize,
    rng: StdRng,
    filter: &'a dyn ObjectFilter,
}

impl<'a> SceneGenerator<'a> {
    pub fn new(size: u32, num_objects: usize, seed: u64, filter: &'a dyn ObjectFilter) -> Result<Self> {
        // the largest object must fit with a one pixel margin
        if size < 4 * MIN_OBJECT_SIZE + 4 {
            bail!("image size {} is too small for objects of size up to {}", size, 2 * MIN_OBJECT_SIZE);
        }
        Ok(Self {
            size,
            num_objects,
            rng: StdRng::seed_from_u64(seed),
            filter,
        })
    }

    fn sample_allowed_object(&mut self) -> Result<(&'static str, &'static str)> {
        for _ in 0..SHAPES.len() * COLORS.len() * 100 {
            let shape = SHAPES[self.rng.gen_range(0..SHAPES.len())];
            let color = COLORS[self.rng.gen_range(0..COLORS.len())].0;
            if self.filter.allowed(shape, color, Purpose::Generate) {
                return Ok((shape, color));
            }
        }
        bail!("the object filter allows no objects in scenes")
    }

    /// Place objects without overlapping bounding squares; starts over after
    /// too many placement failures.
    pub fn generate_scene(&mut self) -> Result<(Vec<SceneObject>, RgbImage)> {
        'scene: for _ in 0..MAX_SCENE_RESTARTS {
            let mut canvas = RgbImage::new(self.size, self.size);
            let mut objects: Vec<SceneObject> = Vec::with_capacity(self.num_objects);
            let mut failures = 0;

            while objects.len() < self.num_objects {
                let (shape, color) = self.sample_allowed_object()?;
                let obj_size = self.rng.gen_range(MIN_OBJECT_SIZE..2 * MIN_OBJECT_SIZE);
                let min_center = i64::from(obj_size / 2 + 1);
                let max_center = i64::from(self.size) - i64::from((obj_size + 1) / 2) - 1;

                let mut placed = false;
                for _ in 0..PLACEMENT_ATTEMPTS {
                    let x = self.rng.gen_range(min_center..max_center);
                    let y = self.rng.gen_range(min_center..max_center);
                    let overlap = objects.iter().any(|other| {
                        let min_dist = i64::from(obj_size + other.size) + 1;
                        (x - other.pos.0).abs() + (y - other.pos.1).abs() < min_dist
                    });
                    if overlap {
                        continue;
                    }

                    let half = i64::from(obj_size / 2);
                    blit(&mut canvas, &object_bitmap(shape, color, obj_size)?, x - half, y - half);
                    objects.push(SceneObject {
                        pos: (x, y),
                        size: obj_size,
                        shape: shape.to_string(),
                        color: color.to_string(),
                    });
                    placed = true;
                    break;
                }

                if !placed {
                    failures += 1;
                    if failures == MAX_PLACEMENT_FAILURES {
                        continue 'scene;
                    }
                }
            }
            return Ok((objects, canvas));
        }
        bail!(
            "could not place {} objects on a {}x{} image",
            self.num_objects,
            self.size,
            self.size
        )
    }
}

fn question_words() -> Vec<String> {
    let mut colors: Vec<&str> = COLORS.iter().map(|(c, _)| *c).collect();
    colors.sort_unstable();
    [NULL_TOKEN, START_TOKEN, END_TOKEN, "is", "there", "a"]
        .into_iter()
        .chain(colors)
        .chain(SHAPES)
        .map(str::to_string)
        .collect()
}

fn program_words() -> Vec<String> {
    let mut colors: Vec<&str> = COLORS.iter().map(|(c, _)| *c).collect();
    colors.sort_unstable();
    [NULL_TOKEN, START_TOKEN, END_TOKEN, SCENE_TOKEN, "And"]
        .into_iter()
        .chain(colors)
        .chain(SHAPES)
        .map(str::to_string)
        .collect()
}

pub fn flatqa_vocab() -> Vocab {
    let index = |words: Vec<String>| words.into_iter().zip(0..).collect();
    let program_token_to_idx: std::collections::BTreeMap<String, i64> = index(program_words());
    let program_token_arity = program_token_to_idx
        .keys()
        .map(|t| {
            let arity = match t.as_str() {
                "And" => 2,
                SCENE_TOKEN => 0,
                _ => 1,
            };
            (t.clone(), arity)
        })
        .collect();
    Vocab {
        question_token_to_idx: index(question_words()),
        program_token_to_idx,
        program_token_arity,
        answer_token_to_idx: [("false".to_string(), 0), ("true".to_string(), 1)]
            .into_iter()
            .collect(),
        ..Default::default()
    }
}

/// One generated split.
pub struct FlatQaSplit {
    pub features: FeatureStore,
    pub questions: QuestionStore,
    pub scenes: Vec<Vec<SceneObject>>,
}

/// Generate `num_examples` questions over fresh scenes. `seed` drives question sampling.
pub fn generate_dataset(
    image_size: u32,
    num_examples: usize,
    seed: u64,
    filter: &dyn ObjectFilter,
) -> Result<FlatQaSplit> {
    let vocab = flatqa_vocab();
    let mut scenes_gen = SceneGenerator::new(image_size, OBJECTS_PER_SCENE, SCENE_SEED, filter)?;
    let mut rng = StdRng::seed_from_u64(seed);

    let side = image_size as usize;
    let mut features = Vec::with_capacity(num_examples * 3 * side * side);
    let mut questions = Vec::with_capacity(num_examples);
    let mut programs = Vec::with_capacity(num_examples);
    let mut answers = Vec::with_capacity(num_examples);
    let mut scenes = Vec::with_capacity(num_examples);

    let started = Instant::now();
    let mut scenes_drawn = 0;
    while answers.len() < num_examples {
        scenes_drawn += 1;
        if scenes_drawn > MAX_SCENES_PER_EXAMPLE * num_examples.max(1) {
            bail!("could not generate {} questions under the object filter", num_examples);
        }
        let (scene, canvas) = scenes_gen.generate_scene()?;
        let answer = answers.len() % 2 == 1;

        let (shape, color) = if answer {
            let candidates: Vec<&SceneObject> = scene
                .iter()
                .filter(|o| filter.allowed(&o.shape, &o.color, Purpose::Ask))
                .collect();
            if candidates.is_empty() {
                continue;
            }
            let obj = candidates[rng.gen_range(0..candidates.len())];
            (obj.shape.clone(), obj.color.clone())
        } else {
            let mut absent = None;
            for _ in 0..NEGATIVE_ATTEMPTS {
                let shape = SHAPES[rng.gen_range(0..SHAPES.len())];
                let color = COLORS[rng.gen_range(0..COLORS.len())].0;
                if !filter.allowed(shape, color, Purpose::Ask) {
                    continue;
                }
                if !scene.iter().any(|o| o.shape == shape && o.color == color) {
                    absent = Some((shape.to_string(), color.to_string()));
                    break;
                }
            }
            match absent {
                Some(pair) => pair,
                None => continue,
            }
        };

        let question = ["is", "there", "a", color.as_str(), shape.as_str()];
        let program = [START_TOKEN, "And", shape.as_str(), SCENE_TOKEN, color.as_str(), SCENE_TOKEN, END_TOKEN];
        questions.push(question.iter().map(|w| vocab.question_token_to_idx[*w]).collect::<Vec<_>>());
        programs.push(program.iter().map(|w| vocab.program_token_to_idx[*w]).collect::<Vec<_>>());
        answers.push(i64::from(answer));
        features.extend(image_to_features(&canvas));
        scenes.push(scene);
    }

    let n = answers.len();
    if n > 0 {
        info!(
            "Generated {} examples in {:.2}s",
            n,
            started.elapsed().as_secs_f64()
        );
    }
    Ok(FlatQaSplit {
        features: FeatureStore::new([n, 3, side, side], features)?,
        questions: QuestionStore {
            questions: IntMatrix::from_rows(&questions),
            programs: Some(IntMatrix::from_rows(&programs)),
            answers,
            image_idxs: (0..n as i64).collect(),
        },
        scenes,
    })
}

/// Split sizes and seeds for a full dataset.
#[derive(Debug, Clone)]
pub struct FlatQaOptions {
    pub train: usize,
    pub val: usize,
    pub test: usize,
    pub image_size: u32,
    pub split: Split,
    pub restrict_scene: bool,
}

/// Write `train`, `val` and `test` splits, their scenes and the vocabulary to `out_dir`.
pub fn generate_all(options: &FlatQaOptions, out_dir: &Path) -> Result<()> {
    fs::create_dir_all(out_dir).with_context(|| format!("Failed to create {:?}", out_dir))?;
    let (train_filter, eval_filter) = options.split.filters(options.restrict_scene);
    let parts: [(&str, usize, u64, &dyn ObjectFilter); 3] = [
        ("train", options.train, 1, train_filter.as_ref()),
        ("val", options.val, 2, eval_filter.as_ref()),
        ("test", options.test, 3, eval_filter.as_ref()),
    ];

    for (part, count, seed, filter) in parts {
        let split = generate_dataset(options.image_size, count, seed, filter)?;
        write_split(out_dir, part, &split.features, &split.questions)?;
        let scenes_path = out_dir.join(format!("{}_scenes.json", part));
        let json = serde_json::to_string_pretty(&split.scenes).context("Failed to serialize scenes")?;
        fs::write(&scenes_path, json).with_context(|| format!("Failed to write {:?}", scenes_path))?;
    }

    flatqa_vocab().save(&out_dir.join(VOCAB_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::VqaDataset;
    use crate::datasets::{features_file, questions_file};
    use crate::programs::FunctionTable;
    use tempfile::TempDir;

    #[test]
    fn test_scenes_have_separated_objects() {
        let mut generator = SceneGenerator::new(64, OBJECTS_PER_SCENE, 7, &AllowAll).unwrap();
        for _ in 0..5 {
            let (objects, canvas) = generator.generate_scene().unwrap();
            assert_eq!(objects.len(), OBJECTS_PER_SCENE);
            assert_eq!(canvas.dimensions(), (64, 64));
            for (i, a) in objects.iter().enumerate() {
                assert!((MIN_OBJECT_SIZE..2 * MIN_OBJECT_SIZE).contains(&a.size));
                for b in &objects[i + 1..] {
                    let dist = (a.pos.0 - b.pos.0).abs() + (a.pos.1 - b.pos.1).abs();
                    assert!(dist > i64::from(a.size + b.size));
                }
            }
        }
        assert!(SceneGenerator::new(20, OBJECTS_PER_SCENE, 0, &AllowAll).is_err());
    }

    #[test]
    fn test_answers_match_scenes() {
        let split = generate_dataset(64, 6, 3, &AllowAll).unwrap();
        let vocab = flatqa_vocab();
        let words = {
            let mut w = vec![String::new(); vocab.question_token_to_idx.len()];
            for (t, &i) in &vocab.question_token_to_idx {
                w[i as usize] = t.clone();
            }
            w
        };

        assert_eq!(split.questions.answers, vec![0, 1, 0, 1, 0, 1]);
        assert_eq!(split.features.shape, [6, 3, 64, 64]);
        for (i, scene) in split.scenes.iter().enumerate() {
            let q = split.questions.questions.row(i);
            let (color, shape) = (&words[q[3] as usize], &words[q[4] as usize]);
            let present = scene.iter().any(|o| &o.shape == shape && &o.color == color);
            assert_eq!(present, split.questions.answers[i] == 1);
        }
    }

    #[test]
    fn test_filters() {
        let (train, test) = Split::CoGenT.filters(true);
        assert!(train.allowed("square", "gray", Purpose::Ask));
        assert!(!train.allowed("square", "red", Purpose::Generate));
        assert!(test.allowed("square", "red", Purpose::Ask));
        assert!(!test.allowed("circle", "red", Purpose::Ask));
        assert!(test.allowed("circle", "red", Purpose::Generate));

        let (train, test) = Split::Diagonal.filters(true);
        assert!(!train.allowed("square", "red", Purpose::Generate));
        assert!(train.allowed("circle", "red", Purpose::Ask));
        assert!(test.allowed("empty_square", "green", Purpose::Ask));
        assert!(!test.allowed("circle", "red", Purpose::Ask));

        let (train, test) = Split::LeaveOneOut.filters(false);
        assert!(train.allowed("square", "red", Purpose::Generate));
        assert!(!train.allowed("square", "red", Purpose::Ask));
        assert!(test.allowed("square", "red", Purpose::Ask));
        assert!(!test.allowed("square", "blue", Purpose::Ask));
    }

    #[test]
    fn test_leave_one_out_train_never_asks_held_out() {
        let (train, _) = Split::LeaveOneOut.filters(true);
        let split = generate_dataset(64, 10, 5, train.as_ref()).unwrap();
        for scene in &split.scenes {
            assert!(!scene.iter().any(|o| o.shape == "square" && o.color == "red"));
        }
    }

    #[test]
    fn test_generate_all_writes_loadable_splits() {
        let out = TempDir::new().unwrap();
        let options = FlatQaOptions {
            train: 4,
            val: 2,
            test: 2,
            image_size: 64,
            split: Split::None,
            restrict_scene: true,
        };
        generate_all(&options, out.path()).unwrap();

        let vocab = Vocab::load(&out.path().join(VOCAB_FILE)).unwrap();
        let functions = FunctionTable::from_vocab(&vocab).unwrap();
        let dataset = VqaDataset::load(&questions_file(out.path(), "train"), &features_file(out.path(), "train")).unwrap();
        assert_eq!(dataset.len(), 4);

        let programs = dataset.questions.programs.as_ref().unwrap();
        assert_eq!(programs.cols, 7);
        let tree = functions.parse_prefix(programs.row(0)).unwrap();
        assert_eq!(functions.token(tree.function), "And");
        assert_eq!(tree.inputs.len(), 2);
        assert!(out.path().join("val_scenes.json").exists());
    }
}
