pub mod limits;
pub mod matching;
pub mod signature;
