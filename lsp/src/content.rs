//! Read-only virtual documents showing the rendered form of a diagnostic.
//!
//! A document is addressed as
//! `anvil-diagnostics-view:/diagnostic%20message?<index>#<resource-uri>`:
//! the fragment names the resource, the query the record index.

use std::sync::{Arc, Weak};

use url::Url;

use crate::ctx::Ctx;

pub const DIAGNOSTICS_SCHEME: &str = "anvil-diagnostics-view";

/// Text served for every lookup that misses.
pub const FALLBACK_TEXT: &str = "Unable to find original diagnostic";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticUri {
    pub resource: String,
    pub index: usize,
}

impl DiagnosticUri {
    #[must_use]
    pub fn new(resource: impl Into<String>, index: usize) -> Self {
        Self {
            resource: resource.into(),
            index,
        }
    }

    pub fn to_url(&self) -> Result<Url, url::ParseError> {
        Url::parse(&format!(
            "{DIAGNOSTICS_SCHEME}:/diagnostic%20message?{}#{}",
            self.index, self.resource
        ))
    }

    /// `None` for foreign schemes, a missing fragment, or a non-numeric query.
    #[must_use]
    pub fn from_url(url: &Url) -> Option<Self> {
        if url.scheme() != DIAGNOSTICS_SCHEME {
            return None;
        }
        let resource = url.fragment().filter(|f| !f.is_empty())?;
        let index = url.query()?.parse().ok()?;
        Some(Self::new(resource, index))
    }
}

/// Serves diagnostic documents out of a context's store.
///
/// Holds only a weak reference; once the context is gone every read falls
/// back.
#[derive(Debug, Clone)]
pub struct ContentProvider {
    ctx: Weak<Ctx>,
}

impl ContentProvider {
    #[must_use]
    pub fn new(ctx: &Arc<Ctx>) -> Self {
        Self {
            ctx: Arc::downgrade(ctx),
        }
    }

    #[must_use]
    pub fn provide(&self, url: &Url) -> String {
        let Some(target) = DiagnosticUri::from_url(url) else {
            tracing::debug!(%url, "Not a diagnostic document");
            return FALLBACK_TEXT.to_string();
        };
        self.ctx
            .upgrade()
            .and_then(|ctx| ctx.rendered_diagnostic(&target.resource, target.index))
            .unwrap_or_else(|| FALLBACK_TEXT.to_string())
    }

    /// Like [`Self::provide`], for callers holding an unparsed string.
    #[must_use]
    pub fn provide_str(&self, uri: &str) -> String {
        match Url::parse(uri) {
            Ok(url) => self.provide(&url),
            Err(e) => {
                tracing::debug!(uri, "Unparsable diagnostic document URI: {e}");
                FALLBACK_TEXT.to_string()
            }
        }
    }
}
