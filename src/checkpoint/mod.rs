mod record;

pub use record::{list_checkpoints, load_checkpoint, load_weights, save_checkpoint, CheckpointData};
