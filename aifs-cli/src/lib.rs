//! `aifscli` — command-line front-end for the AIFS storage engine.
//!
//! ## Getting started
//!
//! ```doc
//! ❯ aifscli init
//! initialized storage at ".aifs"
//!
//! ❯ echo -n hello > /tmp/hello.txt
//! ❯ aifscli put /tmp/hello.txt
//! aifs://ea8f163db38682925e4491c5e58d4bb3506ef8c14eb78a86e908c5624a67200f
//!
//! ❯ aifscli get ea8f163db38682925e4491c5e58d4bb3506ef8c14eb78a86e908c5624a67200f
//! hello
//!
//! ❯ aifscli snapshot create default ea8f163d...
//! aifs-snap://7c9d1f66a2b3c04d95e8720b6f1e3a5c8d90412bb7f6ce5a3d82e1904f6b7a2c
//! ```

pub mod command;
pub mod config;
pub mod embedder;
pub mod trace;
