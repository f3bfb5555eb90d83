pub mod codec;
pub mod config;
pub mod context;
pub mod draw;
pub mod error;
pub mod evolution;
pub mod game;
pub mod genome;
pub mod pos;
pub mod replay;
pub mod snake;
pub mod storage;

pub use config::EvolutionConfig;
pub use error::{Result, SnakeError};
pub use evolution::Evolution;
pub use genome::Genome;
