//! Path classification. Pure and header-independent: it only
//! decides which handler family a path belongs to, never whether the
//! request is admitted.

/// The two request families the broker serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// `POST /fort/<capability>` or legacy `POST /agent/<capability>`.
    Capability {
        /// The capability name.
        capability: String,
    },
    /// `POST /fort/needs/<capability>/<name>`.
    NeedCallback {
        /// The capability the need belongs to.
        capability: String,
        /// The `<name>` portion of the need-id.
        name: String,
    },
}

/// Classify a request path. Returns `None` for anything that should
/// resolve to "not found" — an unrecognised prefix, a capability or
/// need segment containing `/`, or a trailing/empty segment.
#[must_use]
pub fn classify(path: &str) -> Option<Route> {
    let rest = path.strip_prefix('/')?;
    let mut segments = rest.split('/');
    match segments.next()? {
        "fort" => classify_fort(segments),
        "agent" => classify_capability_only(segments),
        _ => None,
    }
}

fn classify_fort<'a>(mut segments: impl Iterator<Item = &'a str>) -> Option<Route> {
    let first = segments.next()?;
    if first == "needs" {
        let capability = segments.next()?;
        let name = segments.next()?;
        if segments.next().is_some() || capability.is_empty() || name.is_empty() {
            return None;
        }
        Some(Route::NeedCallback {
            capability: capability.to_string(),
            name: name.to_string(),
        })
    } else {
        if segments.next().is_some() || first.is_empty() {
            return None;
        }
        Some(Route::Capability {
            capability: first.to_string(),
        })
    }
}

fn classify_capability_only<'a>(mut segments: impl Iterator<Item = &'a str>) -> Option<Route> {
    let capability = segments.next()?;
    if segments.next().is_some() || capability.is_empty() {
        return None;
    }
    Some(Route::Capability {
        capability: capability.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fort_capability_route() {
        assert_eq!(
            classify("/fort/tokens"),
            Some(Route::Capability { capability: "tokens".into() })
        );
    }

    #[test]
    fn legacy_agent_capability_route() {
        assert_eq!(
            classify("/agent/tokens"),
            Some(Route::Capability { capability: "tokens".into() })
        );
    }

    #[test]
    fn need_callback_route() {
        assert_eq!(
            classify("/fort/needs/oidc-register/outline"),
            Some(Route::NeedCallback {
                capability: "oidc-register".into(),
                name: "outline".into(),
            })
        );
    }

    #[test]
    fn bare_needs_query_is_not_a_server_route() {
        // GET /fort/needs is consumed, not served, by this broker.
        assert_eq!(classify("/fort/needs"), None);
    }

    #[test]
    fn capability_segment_with_slash_is_not_found() {
        assert_eq!(classify("/fort/tokens/extra"), None);
    }

    #[test]
    fn unknown_prefix_is_not_found() {
        assert_eq!(classify("/other/tokens"), None);
        assert_eq!(classify("/"), None);
        assert_eq!(classify(""), None);
    }
}
