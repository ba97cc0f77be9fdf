pub mod attachments;
pub mod config;
pub mod confluence;
pub mod local;
pub mod publish;
pub mod sanitize;
pub mod storage;
pub mod transform;
pub mod tree;
pub mod validate;
