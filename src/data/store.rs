use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tracing::info;

use crate::error::VrError;
use crate::vocab::Vocab;

/// Row-major i64 matrix.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntMatrix {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<i64>,
}

impl IntMatrix {
    /// Right-pads every row with zeros to the longest row.
    pub fn from_rows(rows: &[Vec<i64>]) -> Self {
        let cols = rows.iter().map(Vec::len).max().unwrap_or(0);
        let mut data = vec![0; rows.len() * cols];
        for (r, row) in rows.iter().enumerate() {
            data[r * cols..r * cols + row.len()].copy_from_slice(row);
        }
        Self { rows: rows.len(), cols, data }
    }

    pub fn row(&self, r: usize) -> &[i64] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    fn check_shape(&self, name: &str) -> Result<(), VrError> {
        if self.rows.checked_mul(self.cols) != Some(self.data.len()) {
            return Err(VrError::Shape(format!(
                "{} matrix is {}x{} but holds {} values",
                name,
                self.rows,
                self.cols,
                self.data.len()
            )));
        }
        Ok(())
    }

    /// First value outside `0..size`, as `(row, value)`.
    fn find_out_of_range(&self, size: usize) -> Option<(usize, i64)> {
        let cols = self.cols.max(1);
        self.data
            .iter()
            .position(|&v| v < 0 || v as usize >= size)
            .map(|i| (i / cols, self.data[i]))
    }
}

/// Image features, `[num_images, C, H, W]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureStore {
    pub shape: [usize; 4],
    pub data: Vec<f32>,
}

impl FeatureStore {
    pub fn new(shape: [usize; 4], data: Vec<f32>) -> Result<Self, VrError> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(VrError::Shape(format!(
                "feature data has {} values, shape {:?} needs {}",
                data.len(),
                shape,
                expected
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn num_images(&self) -> usize {
        self.shape[0]
    }

    /// `[C, H, W]`
    pub fn image_dim(&self) -> [usize; 3] {
        [self.shape[1], self.shape[2], self.shape[3]]
    }

    pub fn image(&self, index: usize) -> &[f32] {
        let size = self.shape[1] * self.shape[2] * self.shape[3];
        &self.data[index * size..(index + 1) * size]
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_bincode(self, path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let store: Self = read_bincode(path)?;
        Self::new(store.shape, store.data).with_context(|| format!("Corrupt feature store {:?}", path))
    }
}

/// Tokenized questions, optional programs, answers and the image each question is about.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuestionStore {
    pub questions: IntMatrix,
    pub programs: Option<IntMatrix>,
    pub answers: Vec<i64>,
    pub image_idxs: Vec<i64>,
}

impl QuestionStore {
    pub fn len(&self) -> usize {
        self.answers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.answers.is_empty()
    }

    pub fn validate(&self, num_images: usize) -> Result<(), VrError> {
        let n = self.answers.len();
        self.questions.check_shape("questions")?;
        if let Some(programs) = &self.programs {
            programs.check_shape("programs")?;
        }
        if self.questions.rows != n || self.image_idxs.len() != n {
            return Err(VrError::Shape(format!(
                "{} questions, {} answers, {} image indices",
                self.questions.rows,
                n,
                self.image_idxs.len()
            )));
        }
        if let Some(programs) = &self.programs {
            if programs.rows != n {
                return Err(VrError::ProgramCountMismatch { questions: n, programs: programs.rows });
            }
        }
        if let Some(&bad) = self.image_idxs.iter().find(|&&i| i < 0 || i as usize >= num_images) {
            return Err(VrError::ImageIndexOutOfRange { index: bad, size: num_images });
        }
        Ok(())
    }

    /// Every question token, program token and answer must index into the vocabulary.
    pub fn check_vocab(&self, vocab: &Vocab) -> Result<(), VrError> {
        let size = vocab.num_question_tokens();
        if let Some((row, value)) = self.questions.find_out_of_range(size) {
            return Err(VrError::IndexOutOfRange { field: "question token", row, value, size });
        }
        if let Some(programs) = &self.programs {
            let size = vocab.program_token_to_idx.len();
            if let Some((row, value)) = programs.find_out_of_range(size) {
                return Err(VrError::IndexOutOfRange { field: "program token", row, value, size });
            }
        }
        let size = vocab.num_answers();
        if let Some((row, &value)) = self
            .answers
            .iter()
            .enumerate()
            .find(|&(_, &a)| a < 0 || a as usize >= size)
        {
            return Err(VrError::IndexOutOfRange { field: "answer", row, value, size });
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_bincode(self, path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        read_bincode(path)
    }
}

fn write_bincode<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }
    let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
    bincode::serialize_into(BufWriter::new(file), value)
        .with_context(|| format!("Failed to write {:?}", path))?;
    info!("Wrote {:?}", path);
    Ok(())
}

fn read_bincode<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    bincode::deserialize_from(BufReader::new(file)).with_context(|| format!("Failed to decode {:?}", path))
}
