pub mod npy;
pub mod sexp;

pub use npy::{parse_npy, read_npy, NpyArray, NpyData};
pub use sexp::{parse_sexp, Sexp};
