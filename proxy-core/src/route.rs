use crate::config::{Config, EnvelopeConfig, RouteConfig, RouteMode};

/// Field-name mapping for an envelope message. Each field is either a name
/// present in the target descriptor, or empty meaning "not mapped" — callers
/// must treat an empty name the same as "field absent" rather than special-casing it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub payload_field: String,
    pub type_url_field: String,
    pub client_sig_field: String,
    pub proxy_sig_field: String,
    pub metadata_field: String,
}

impl From<EnvelopeConfig> for Envelope {
    fn from(cfg: EnvelopeConfig) -> Self {
        Envelope {
            payload_field: cfg.payload_field,
            type_url_field: cfg.type_url_field,
            client_sig_field: cfg.client_sig_field,
            proxy_sig_field: cfg.proxy_sig_field,
            metadata_field: cfg.metadata_field,
        }
    }
}

/// An immutable, owned route rule. Value semantics deliberately: the matcher
/// never returns a borrow into the route table, so callers can hold a
/// `RouteRule` across an `.await` point without entangling it in the table's
/// lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    pub pattern: String,
    pub mode: RouteMode,
    pub envelope: Envelope,
}

impl RouteRule {
    fn from_config(cfg: &RouteConfig) -> Self {
        RouteRule {
            pattern: cfg.pattern.clone(),
            mode: cfg.mode,
            envelope: Envelope::from(cfg.envelope.clone()),
        }
    }

    /// The synthetic default applied when no configured rule matches.
    fn pass_through_default() -> Self {
        RouteRule {
            pattern: String::new(),
            mode: RouteMode::PassThru,
            envelope: Envelope::default(),
        }
    }

    /// True if `pattern` matches `method_id`, either exactly or, for a
    /// `"…/*"` pattern, as a prefix match against everything preceding `/*`.
    fn matches(&self, method_id: &str) -> bool {
        match self.pattern.strip_suffix('*') {
            // Keep the slash before `*` so "/foo.Bar/*" matches "/foo.Bar/Baz"
            // but not "/foo.Barnacle/Baz".
            Some(prefix) if self.pattern.ends_with("/*") => method_id.starts_with(prefix),
            _ => self.pattern == method_id,
        }
    }
}

/// The ordered list of route rules, read-only after construction.
#[derive(Debug, Clone)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
}

impl RouteTable {
    pub fn from_config(config: &Config) -> Self {
        RouteTable {
            rules: config.routes.iter().map(RouteRule::from_config).collect(),
        }
    }

    /// First matching rule in declaration order, or the synthetic
    /// pass-through default if none match. O(n) in the number of rules.
    pub fn match_method(&self, method_id: &str) -> RouteRule {
        self.rules
            .iter()
            .find(|rule| rule.matches(method_id))
            .cloned()
            .unwrap_or_else(RouteRule::pass_through_default)
    }
}
