pub mod assembler;
pub mod download;
pub mod upload;

pub use assembler::Assembler;
pub use download::{DownloadEngine, Piece};
pub use upload::UploadEngine;
