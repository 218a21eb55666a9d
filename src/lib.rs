// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Node core of the sharded document store: live chunk migration between
//! data-bearing nodes, per-collection ownership versioning, and the config
//! store / storage engine seams the migration protocol is built on.

#![doc(
    html_logo_url = "https://github.com/maidsafe/QA/raw/master/Images/maidsafe_logo.png",
    html_favicon_url = "https://maidsafe.net/img/favicon.ico",
    test(attr(deny(warnings)))
)]
// Forbid some very bad patterns. Forbid is stronger than `deny`, preventing us from suppressing the
// lint with `#[allow(...)]` et-all.
#![forbid(
    arithmetic_overflow,
    mutable_transmutes,
    no_mangle_const_items,
    unknown_crate_types,
    unsafe_code
)]
// Turn on some additional warnings to encourage good style.
#![warn(
    missing_debug_implementations,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_results,
    clippy::unicode_not_nfc
)]

#[macro_use]
extern crate tracing;

pub mod comm;
pub mod config_store;
pub mod dbs;
pub mod messaging;
pub mod node;
pub mod types;

pub use node::{Config, Node};

#[cfg(test)]
use std::sync::Once;

#[cfg(test)]
#[ctor::ctor]
fn test_setup() {
    // a second install can only happen if two ctors run, which they don't
    if let Err(error) = color_eyre::install() {
        eprintln!("failed to install error report hooks: {}", error);
    }
}

#[cfg(test)]
static INIT: Once = Once::new();

/// Initialise a compact logger for tests, filtered by `RUST_LOG`. Callable
/// from any test; only the first call installs a subscriber.
#[cfg(test)]
pub fn init_test_logger() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .with_target(false)
            .compact()
            .init()
    });
}
