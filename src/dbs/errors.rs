// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::types::DocId;

use std::io;
use thiserror::Error;

/// Specialisation of `std::Result` for dbs.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Storage engine error variants.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The namespace does not exist locally.
    #[error("No such collection: {0:?}")]
    NoSuchCollection(String),
    /// A write was attempted with a document that carries no `_id`.
    #[error("Document has no _id field")]
    DocMissingId,
    /// A point read by id found nothing.
    #[error("No such document: {0}")]
    NoSuchDoc(DocId),
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Bincode error.
    #[error("Bincode error:: {0}")]
    Bincode(#[from] bincode::Error),
}
