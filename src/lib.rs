//! lfqgpt - class-conditional autoregressive transformer over quantized
//! image/video codes, in Rust using Burn
//!
//! The model consumes discrete codes produced by a lookup-free quantized
//! autoencoder, conditions on a class label, and decodes step by step with
//! a key/value cache and classifier-free guidance.
// Copyright [2025] tuned.org.uk, Mec-iS
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub mod backend;
pub mod cache;
pub mod causalattention;
pub mod checkpoint;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod gpt;
pub mod init;
pub mod sampling;
pub use checkpoint::{load_checkpoint, load_weights, save_checkpoint, save_weights};

#[cfg(test)]
mod tests;

pub use backend::{AutoBackend, TrainBackend, get_device, print_backend_info};
pub use config::GptConfig;
pub use error::{ConfigError, GptError, Result};

use std::sync::Once;

static INIT: Once = Once::new();

pub fn init() {
    INIT.call_once(|| {
        // Read RUST_LOG env variable, default to "info" if not set
        let env = env_logger::Env::default().default_filter_or("info");

        // don't panic if called multiple times across binaries
        let _ = env_logger::Builder::from_env(env)
            .is_test(cfg!(test))
            .try_init();
    });
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        backend::{AutoBackend, get_device},
        cache::KvCache,
        config::GptConfig,
        embedding::StepInput,
        engine::{Engine, SampleConfig},
        gpt::GptModel,
    };
}
