use crate::view::QueryError;
use query::{query_hash, Ast, Ttl};
use std::collections::HashMap;

/// Invoked once the server settles a registered query: `got(true, None)`
/// when it is marked complete, `got(false, Some(error))` when its
/// transform fails.
pub type GotCallback = Box<dyn FnMut(bool, Option<&QueryError>)>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum QueryState {
    Pending,
    Complete,
    Failed,
}

struct QueryEntry {
    ast: Ast,
    custom_id: Option<String>,
    ttl: Ttl,
    refs: usize,
    state: QueryState,
    error: Option<QueryError>,
    callbacks: Vec<GotCallback>,
}

/// ServerQueries tracks the queries registered with the server, keyed by
/// canonical query hash and reference-counted across subscribers.
///
/// Registration is idempotent per hash: re-adding bumps the count and, if
/// the query has already settled, fires the new callback immediately.
#[derive(Default)]
pub struct ServerQueries {
    entries: HashMap<String, QueryEntry>,
}

impl ServerQueries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a server-evaluated query. Returns its hash.
    pub fn add_server_query(&mut self, ast: Ast, ttl: Ttl, got: GotCallback) -> String {
        self.add(ast, None, ttl, got)
    }

    /// Register a custom (named) query. Returns its hash.
    pub fn add_custom_query(
        &mut self,
        ast: Ast,
        custom_query_id: &str,
        ttl: Ttl,
        got: GotCallback,
    ) -> String {
        self.add(ast, Some(custom_query_id.to_string()), ttl, got)
    }

    fn add(
        &mut self,
        ast: Ast,
        custom_id: Option<String>,
        ttl: Ttl,
        mut got: GotCallback,
    ) -> String {
        let hash = query_hash(&ast);
        let entry = self.entries.entry(hash.clone()).or_insert_with(|| {
            tracing::debug!(hash = %hash, "registered server query");
            QueryEntry {
                ast,
                custom_id,
                ttl,
                refs: 0,
                state: QueryState::Pending,
                error: None,
                callbacks: Vec::new(),
            }
        });
        entry.refs += 1;

        match entry.state {
            QueryState::Pending => entry.callbacks.push(got),
            QueryState::Complete => got(true, None),
            QueryState::Failed => got(false, entry.error.as_ref()),
        }
        hash
    }

    /// Drop one subscriber. The registration survives (for the server's
    /// TTL) until explicitly evicted.
    pub fn remove(&mut self, hash: &str) {
        if let Some(entry) = self.entries.get_mut(hash) {
            entry.refs = entry.refs.saturating_sub(1);
        }
    }

    /// Evict registrations with no subscribers; the host calls this when
    /// the server's retention window lapses.
    pub fn evict_unreferenced(&mut self) {
        self.entries.retain(|hash, entry| {
            let keep = entry.refs > 0;
            if !keep {
                tracing::debug!(hash = %hash, "evicted server query");
            }
            keep
        });
    }

    /// The server confirmed the query is fully synced.
    pub fn mark_complete(&mut self, hash: &str) {
        if let Some(entry) = self.entries.get_mut(hash) {
            entry.state = QueryState::Complete;
            entry.error = None;
            for mut callback in entry.callbacks.drain(..) {
                callback(true, None);
            }
        }
    }

    /// The server failed to transform the query.
    pub fn mark_failed(&mut self, hash: &str, error: QueryError) {
        if let Some(entry) = self.entries.get_mut(hash) {
            entry.state = QueryState::Failed;
            entry.error = Some(error);
            for mut callback in entry.callbacks.drain(..) {
                callback(false, entry.error.as_ref());
            }
        }
    }

    pub fn update_ttl(&mut self, hash: &str, ttl: Ttl) {
        if let Some(entry) = self.entries.get_mut(hash) {
            entry.ttl = ttl;
        }
    }

    pub fn ttl(&self, hash: &str) -> Option<Ttl> {
        self.entries.get(hash).map(|entry| entry.ttl)
    }

    pub fn refs(&self, hash: &str) -> usize {
        self.entries.get(hash).map(|entry| entry.refs).unwrap_or(0)
    }

    pub fn ast(&self, hash: &str) -> Option<&Ast> {
        self.entries.get(hash).map(|entry| &entry.ast)
    }

    pub fn custom_query_id(&self, hash: &str) -> Option<&str> {
        self.entries
            .get(hash)
            .and_then(|entry| entry.custom_id.as_deref())
    }
}
