//! tg-export: web-controlled Telegram export engine with Hexagonal
//! Architecture. Jobs scan chat history chronologically, download every
//! referenced media object to a content-addressed tree, and survive any
//! interruption through the resume store.

pub mod adapters;
pub mod domain;
pub mod ports;
pub mod shared;
pub mod usecases;
