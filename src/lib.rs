// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Columnar rowset and segment storage for an analytical database.

#![deny(unused_must_use)]

pub mod array;
pub mod catalog;
pub mod storage;
pub mod types;
