pub mod completions;
pub mod entities;
pub mod kv;
