// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Module helpers
//!
//! This crate contains the pieces shared by Janus modules: the per-request
//! [`Session`] capturing the response before it is flushed, the collaborator
//! interfaces a module may call into ([`HttpHandler`], [`AuthGate`],
//! [`RouteRegistry`], [`Notifier`]), standard response pages and
//! configuration loading.

use log::trace;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

mod env;
mod query;
mod session;
pub mod standard_response;

pub use env::lookup_env;
pub use query::{parse_cookie_header, parse_query, serialize_cookie_header, serialize_query};
pub use session::{SharedData, Session};

/// Error returned by [`HttpHandler`] implementations.
///
/// Transport-level cancellations get their own variants so that callers can
/// swallow them instead of reporting them as pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The client went away before the response could be written.
    #[error("client cancelled the request")]
    Cancelled,

    /// The underlying stream was closed mid-exchange.
    #[error("stream closed")]
    StreamClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Message(String),
}

impl HandlerError {
    /// Whether this error is an expected transport cancellation that should
    /// not be surfaced to the user.
    pub fn is_benign_cancel(&self) -> bool {
        matches!(self, Self::Cancelled | Self::StreamClosed)
    }
}

/// An HTTP handler operating on a [`Session`].
///
/// This is the seam through which a module reaches the upstream, another
/// route or any other response producer. The handler writes status, headers
/// and body into the session's response capture.
pub trait HttpHandler: Send + Sync {
    fn handle(&self, session: &mut Session) -> Result<(), HandlerError>;
}

impl<F> HttpHandler for F
where
    F: Fn(&mut Session) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, session: &mut Session) -> Result<(), HandlerError> {
        self(session)
    }
}

/// Authentication hook consulted by modules that defer authentication to the
/// surrounding server.
///
/// Returning `false` denies the request; the hook may have written a
/// challenge response into the session either way.
pub trait AuthGate: Send + Sync {
    fn check(&self, session: &mut Session) -> bool;
}

/// Lookup of named HTTP routes.
pub trait RouteRegistry: Send + Sync {
    /// Returns the handler registered under `name`.
    fn get(&self, name: &str) -> Option<Arc<dyn HttpHandler>>;

    /// Returns a handler from the excluded-routes map. Excluded routes are
    /// not reachable through regular routing but may still be dispatched to
    /// explicitly.
    fn get_excluded(&self, _name: &str) -> Option<Arc<dyn HttpHandler>> {
        None
    }
}

/// A notification record handed to a [`Notifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyMessage {
    pub level: log::Level,
    pub title: String,
    pub body: String,
    pub to: Vec<String>,
}

/// Sink for notification records.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: NotifyMessage);
}

/// Trait for configuration structures that can be loaded from YAML. This
/// trait has a blanket implementation for any structure implementing
/// [`serde::Deserialize`].
pub trait FromYaml {
    /// Loads configuration from a YAML file.
    fn load_from_yaml<P>(path: P) -> Result<Self, ConfError>
    where
        P: AsRef<Path>,
        Self: Sized;

    /// Loads configuration from YAML text.
    fn from_yaml(yaml: impl AsRef<str>) -> Result<Self, ConfError>
    where
        Self: Sized;
}

/// Error produced when loading configuration files.
#[derive(Debug, thiserror::Error)]
pub enum ConfError {
    #[error("failed opening configuration file: {0}")]
    FileOpen(#[source] std::io::Error),

    #[error("failed reading configuration file: {0}")]
    FileRead(#[source] serde_yaml::Error),
}

impl<D> FromYaml for D
where
    D: DeserializeOwned + Debug + ?Sized,
{
    fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, ConfError> {
        let file = File::open(path.as_ref()).map_err(ConfError::FileOpen)?;
        let reader = BufReader::new(file);

        let conf = serde_yaml::from_reader(reader).map_err(ConfError::FileRead)?;
        trace!("Loaded configuration file: {conf:#?}");

        Ok(conf)
    }

    fn from_yaml(yaml: impl AsRef<str>) -> Result<Self, ConfError> {
        let conf = serde_yaml::from_str(yaml.as_ref()).map_err(ConfError::FileRead)?;
        trace!("Loaded configuration: {conf:#?}");

        Ok(conf)
    }
}
