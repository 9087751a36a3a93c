// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Core engine: work partitioning, task representation, result channels and
//! synchronization primitives.

pub mod dispatcher;
pub mod promise;
pub mod range;
#[cfg(feature = "default-thread-pool")]
pub mod sync;
pub mod task;
mod util;
pub mod workers;
