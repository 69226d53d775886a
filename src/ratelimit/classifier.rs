//! Endpoint classification.
//!
//! Maps a raw request path to the rate limit class that governs it. Paths are
//! normalized first (query string and fragment removed, a dynamic segment such
//! as a username collapsed) and then matched against configured route prefixes.
//! The longest matching prefix wins; among equally long prefixes the first
//! declared route wins.

use super::class::RateLimitClass;

/// A route prefix bound to a class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteClass {
    /// Path prefix, matched with `starts_with` against the normalized path
    pub prefix: String,
    /// The class applied to matching paths
    pub class: RateLimitClass,
}

/// Pure path-to-class mapping.
#[derive(Debug, Clone)]
pub struct EndpointClassifier {
    default: RateLimitClass,
    routes: Vec<RouteClass>,
    dynamic_prefixes: Vec<String>,
    /// Classes that are looked up by name rather than by path
    named: Vec<RateLimitClass>,
}

impl EndpointClassifier {
    /// Create a classifier. `routes` keep their declaration order for tie-breaks.
    pub fn new(
        default: RateLimitClass,
        routes: Vec<RouteClass>,
        dynamic_prefixes: Vec<String>,
    ) -> Self {
        Self {
            default,
            routes,
            dynamic_prefixes,
            named: Vec::new(),
        }
    }

    /// Register classes that callers select by name (e.g. `login`).
    pub fn with_named_classes(mut self, classes: Vec<RateLimitClass>) -> Self {
        self.named = classes;
        self
    }

    /// The class used when no route matches.
    pub fn default_class(&self) -> &RateLimitClass {
        &self.default
    }

    /// Configured routes in declaration order.
    pub fn routes(&self) -> &[RouteClass] {
        &self.routes
    }

    /// Look up a class by name among the default, named and routed classes.
    pub fn class(&self, name: &str) -> Option<&RateLimitClass> {
        if self.default.name == name {
            return Some(&self.default);
        }
        self.named
            .iter()
            .chain(self.routes.iter().map(|r| &r.class))
            .find(|c| c.name == name)
    }

    /// Normalize a request path for matching.
    ///
    /// `/api/v1/alice/links?limit=10` becomes `/api/v1/links` when `/api/v1/`
    /// is a dynamic prefix. The segment after the prefix is only dropped when
    /// another segment follows it, so `/api/v1/links` stays as is.
    pub fn normalize_path<'a>(&self, path: &'a str) -> std::borrow::Cow<'a, str> {
        let end = path.find(['?', '#']).unwrap_or(path.len());
        let path = &path[..end];

        for prefix in &self.dynamic_prefixes {
            let Some(rest) = path.strip_prefix(prefix.as_str()) else {
                continue;
            };
            if let Some(slash) = rest.find('/') {
                if slash > 0 && slash + 1 < rest.len() {
                    let mut normalized = String::with_capacity(path.len());
                    normalized.push_str(prefix);
                    normalized.push_str(&rest[slash + 1..]);
                    return std::borrow::Cow::Owned(normalized);
                }
            }
            break;
        }

        std::borrow::Cow::Borrowed(path)
    }

    /// Find the most specific class for a path.
    pub fn classify(&self, path: &str) -> &RateLimitClass {
        let normalized = self.normalize_path(path);

        let mut best: Option<&RouteClass> = None;
        for route in &self.routes {
            if !normalized.starts_with(route.prefix.as_str()) {
                continue;
            }
            // Strictly longer only, so the first declared route keeps a tie
            match best {
                Some(current) if current.prefix.len() >= route.prefix.len() => {}
                _ => best = Some(route),
            }
        }

        best.map(|r| &r.class).unwrap_or(&self.default)
    }
}
