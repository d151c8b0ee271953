//! Flash-writing code that lays images onto a NAND, either raw or through the translation layer.
//!
//! Writes are idempotent: an image already in place causes no erases or writes, and a partially
//! written one is resumed.

pub mod raw;
