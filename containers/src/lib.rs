pub mod block;
pub mod checkpoint;
pub mod generator;
pub mod root;
pub mod types;
pub mod validator;

pub use block::{is_linked, Block, BlockBody, Header};
pub use checkpoint::{Checkpoint, Milestone};
pub use root::headers_root;
pub use types::{BlockNumber, Bytes32, ValidatorIndex};
pub use validator::{compute_seal, Validator, ValidatorSet};
