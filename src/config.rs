// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the Remote Call library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Client configuration and ambient serializer options.
//!
//! Serializer options are looked up in three tiers: options configured for the route being
//! called, then the client's global options, then [SerializerOptions::default]. The first tier
//! which is present wins. The same lookup is used when encoding request bodies and when
//! decoding response bodies, so a route configured to pretty-print JSON requests also decodes
//! its responses with the same settings.

use crate::content::Charset;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct JsonOptions {
    /// Emit indented JSON for request bodies.
    pub pretty: bool,
    /// Field holding the payload of wrapped JSON responses.
    pub data_field: String,
}

impl Default for JsonOptions {
    fn default() -> Self {
        Self {
            pretty: false,
            data_field: "data".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct XmlOptions {
    /// Root element for objects sent with an XML content type. Objects are serialized as XML
    /// only when this is set; otherwise they are written as JSON like any other string-like
    /// content type.
    pub root: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SerializerOptions {
    pub json: JsonOptions,
    pub xml: XmlOptions,
}

/// Configuration shared by every call made through a [RemoteClient](crate::client::RemoteClient).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL which relative request URLs are resolved against.
    pub base_url: Option<String>,
    /// Timeout applied to requests which do not declare their own.
    #[serde(with = "optional_millis")]
    pub timeout: Option<Duration>,
    /// Content type used for request bodies whose type cannot be inferred.
    pub default_content_type: Option<String>,
    /// Charset used for textual request bodies which do not declare one.
    pub default_charset: Charset,
    /// Global serializer options.
    pub serializer: Option<SerializerOptions>,
    /// Serializer options for individual routes, keyed by route (method) name.
    pub routes: HashMap<String, SerializerOptions>,
}

impl ClientConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context(crate::error::JsonDecodeSnafu)
    }
}

/// Ambient services available to processors and converters while a call is in flight.
#[derive(Clone, Debug, Default)]
pub struct ServiceContext {
    config: Arc<ClientConfig>,
    route: Option<String>,
}

impl ServiceContext {
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self {
            config,
            route: None,
        }
    }

    /// A view of this context scoped to a single route.
    pub fn for_route(&self, route: impl Into<String>) -> Self {
        Self {
            config: self.config.clone(),
            route: Some(route.into()),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn route(&self) -> Option<&str> {
        self.route.as_deref()
    }

    /// Resolve serializer options: route, then global, then process default.
    pub fn serializer_options(&self) -> SerializerOptions {
        self.route
            .as_ref()
            .and_then(|route| self.config.routes.get(route))
            .or_else(|| self.config.serializer.as_ref())
            .cloned()
            .unwrap_or_default()
    }
}

/// Resolve serializer options for an optional context.
pub(crate) fn serializer_options(context: Option<&ServiceContext>) -> SerializerOptions {
    context
        .map(ServiceContext::serializer_options)
        .unwrap_or_default()
}

mod optional_millis {
    use serde::ser::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::convert::TryFrom;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => {
                let millis = u64::try_from(d.as_millis()).map_err(|_| {
                    S::Error::custom(format!("timeout of {:?} does not fit in u64 millis", d))
                })?;
                s.serialize_some(&millis)
            }
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

impl From<ClientConfig> for ServiceContext {
    fn from(config: ClientConfig) -> Self {
        Self::new(Arc::new(config))
    }
}

pub(crate) fn validate_base_url(url: &str) -> Result<surf::Url> {
    surf::Url::parse(url).map_err(|err| Error::InvalidUrl {
        url: url.to_string(),
        message: err.to_string(),
    })
}
