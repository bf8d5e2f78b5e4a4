//! Endpoint to rate-limit bucket resolution
//!
//! The remote API publishes which endpoints share a rate-limit budget. That
//! table ships embedded in the binary, is compiled once into a segment trie
//! and is consulted on every outbound request. A path segment in a pattern is
//! either a literal or the wildcard `ID`, which matches exactly one non-empty
//! request segment.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::debug;

/// Bucket used when no rule matches
pub const DEFAULT_BUCKET: &str = "default";

/// Wildcard token in canonical paths
pub const WILDCARD: &str = "ID";

/// Only rows of this type describe individual endpoints.
const URL_ROW_TYPE: &str = "URL";

/// Path prefixes the provider talks to.
const RETAINED_PREFIXES: [&str; 3] = ["/.well-known", "/api/v1", "/oauth2"];

/// Undocumented endpoints never called by the provider.
const DISCARDED_PREFIX: &str = "/api/v1/internal";

static EMBEDDED_TABLE: &str = include_str!("rate_limits.txt");

static TEMPLATE_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{[^/{}]+\}").expect("template parameter pattern is valid"));

static EMBEDDED: LazyLock<Arc<EndpointResolver>> = LazyLock::new(|| {
    let rules = parse_mapping(EMBEDDED_TABLE);
    debug!(rules = rules.len(), "Compiled rate-limit bucket table");
    Arc::new(EndpointResolver::from_rules(rules))
});

/// One row of the compiled mapping table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketRule {
    /// Canonical path pattern, e.g. `/api/v1/users/ID/factors`
    pub pattern: String,
    /// Upper-case HTTP method
    pub method: String,
    /// Bucket name
    pub bucket: String,
}

/// Outcome of resolving a request against the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointMatch {
    /// Bucket the request is charged against
    pub bucket: String,
    /// Request path with variable segments replaced by `ID`
    pub canonical_path: String,
}

/// Parse the whitespace-separated mapping file.
///
/// Each line reads `path method ... bucket type`. Comment lines start with `#`.
#[must_use]
pub fn parse_mapping(text: &str) -> Vec<BucketRule> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }
            let path = fields[0];
            let row_type = fields[fields.len() - 1];
            if row_type != URL_ROW_TYPE
                || path.starts_with(DISCARDED_PREFIX)
                || !RETAINED_PREFIXES.iter().any(|p| path.starts_with(p))
            {
                return None;
            }
            Some(BucketRule {
                pattern: TEMPLATE_PARAM.replace_all(path, WILDCARD).into_owned(),
                method: fields[1].to_ascii_uppercase(),
                bucket: fields[fields.len() - 2].to_string(),
            })
        })
        .collect()
}

#[derive(Debug, Default)]
struct Node {
    literals: HashMap<String, Node>,
    wildcard: Option<Box<Node>>,
    /// method -> bucket for patterns ending here
    buckets: HashMap<String, String>,
}

/// Deepest terminal reached so far.
#[derive(Debug, Clone)]
struct Candidate {
    depth: usize,
    literals: usize,
    wildcards: Vec<bool>,
    bucket: Option<String>,
}

impl Candidate {
    fn beats(&self, other: &Self) -> bool {
        (self.depth, self.literals) > (other.depth, other.literals)
    }
}

/// Compiled, immutable bucket table
#[derive(Debug)]
pub struct EndpointResolver {
    root: Node,
    rules: Vec<BucketRule>,
}

impl EndpointResolver {
    /// Table compiled from the embedded mapping file
    #[must_use]
    pub fn embedded() -> Arc<Self> {
        Arc::clone(&EMBEDDED)
    }

    /// Build a table from explicit rules
    #[must_use]
    pub fn from_rules(rules: Vec<BucketRule>) -> Self {
        let mut root = Node::default();
        for rule in &rules {
            let mut node = &mut root;
            for segment in segments(&rule.pattern) {
                node = if segment == WILDCARD {
                    &mut **node.wildcard.get_or_insert_with(Box::default)
                } else {
                    node.literals.entry(segment.to_string()).or_default()
                };
            }
            node.buckets
                .entry(rule.method.clone())
                .or_insert_with(|| rule.bucket.clone());
        }
        Self { root, rules }
    }

    /// Rules the table was built from
    #[must_use]
    pub fn rules(&self) -> &[BucketRule] {
        &self.rules
    }

    /// Bucket name for a request
    #[must_use]
    pub fn bucket_for(&self, method: &str, path: &str) -> String {
        self.resolve(method, path).bucket
    }

    /// Resolve a request to its bucket and canonical path.
    ///
    /// The longest pattern that is a segment-wise prefix of the path and
    /// whose method matches wins; among equally long patterns the one with
    /// more literal segments wins.
    #[must_use]
    pub fn resolve(&self, method: &str, path: &str) -> EndpointMatch {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        let request: Vec<&str> = segments(path).collect();
        let method = method.to_ascii_uppercase();

        let mut best_for_method: Option<Candidate> = None;
        let mut best_any: Option<Candidate> = None;
        let mut trail = Vec::with_capacity(request.len());
        search(
            &self.root,
            &request,
            0,
            &mut trail,
            &method,
            &mut best_for_method,
            &mut best_any,
        );

        let (bucket, shape) = match best_for_method {
            Some(c) => (c.bucket.clone().unwrap_or_default(), Some(c)),
            None => (DEFAULT_BUCKET.to_string(), best_any),
        };

        EndpointMatch {
            bucket,
            canonical_path: canonicalize(&request, shape.as_ref()),
        }
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

fn search(
    node: &Node,
    request: &[&str],
    literals: usize,
    trail: &mut Vec<bool>,
    method: &str,
    best_for_method: &mut Option<Candidate>,
    best_any: &mut Option<Candidate>,
) {
    let depth = trail.len();
    if !node.buckets.is_empty() {
        let candidate = Candidate {
            depth,
            literals,
            wildcards: trail.clone(),
            bucket: node.buckets.get(method).cloned(),
        };
        if candidate.bucket.is_some() && best_for_method.as_ref().is_none_or(|b| candidate.beats(b)) {
            *best_for_method = Some(candidate.clone());
        }
        if best_any.as_ref().is_none_or(|b| candidate.beats(b)) {
            *best_any = Some(candidate);
        }
    }

    let Some(segment) = request.get(depth) else {
        return;
    };
    if let Some(child) = node.literals.get(*segment) {
        trail.push(false);
        search(child, request, literals + 1, trail, method, best_for_method, best_any);
        trail.pop();
    }
    if let Some(child) = &node.wildcard {
        trail.push(true);
        search(child, request, literals, trail, method, best_for_method, best_any);
        trail.pop();
    }
}

fn canonicalize(request: &[&str], shape: Option<&Candidate>) -> String {
    let wildcards = shape.map(|c| c.wildcards.as_slice()).unwrap_or_default();
    let mut out = String::new();
    for (i, segment) in request.iter().enumerate() {
        out.push('/');
        if wildcards.get(i).copied().unwrap_or(false) {
            out.push_str(WILDCARD);
        } else {
            out.push_str(segment);
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}
