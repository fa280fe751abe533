//! Recursive permission resolution over the relation graph
//!
//! A role's rules live in the same relation as everything else: children of
//! the role row typed `AccessRule`, one target per rule. Checking access
//! walks the graph upward through type, array-membership, reference and
//! parent edges in fixed precedence, with a depth guard because the data
//! model does not forbid cycles.
//!
//! Any storage error during resolution converts to "not granted" and a log
//! line. An inability to prove access is never treated as access.

use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::store::RelationStore;
use crate::types::{BaseType, RowId, ROOT};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Requested or granted access level. Write subsumes read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GrantLevel {
    Read,
    Write,
}

impl GrantLevel {
    /// Whether a rule at this level satisfies a request at `requested`.
    pub fn satisfies(self, requested: GrantLevel) -> bool {
        self == GrantLevel::Write || requested == GrantLevel::Read
    }

    fn parse(text: &str) -> Option<GrantLevel> {
        match text {
            "READ" => Some(GrantLevel::Read),
            "WRITE" => Some(GrantLevel::Write),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            GrantLevel::Read => "READ",
            GrantLevel::Write => "WRITE",
        }
    }
}

/// One access rule: a level plus optional sub-grants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantRule {
    pub level: GrantLevel,
    pub mask: bool,
    pub export: bool,
    pub delete: bool,
}

impl GrantRule {
    pub fn new(level: GrantLevel) -> Self {
        GrantRule {
            level,
            mask: false,
            export: false,
            delete: false,
        }
    }

    /// Parse the stored rule payload `<target>|LEVEL[|mask][|exp][|del]`.
    /// Malformed payloads yield nothing; a rule that cannot be read grants
    /// nothing.
    pub fn parse(payload: &str) -> Option<(RowId, GrantRule)> {
        let mut parts = payload.split('|');
        let target: u64 = parts.next()?.parse().ok()?;
        let level = GrantLevel::parse(parts.next()?)?;
        let mut rule = GrantRule::new(level);
        for flag in parts {
            match flag {
                "mask" => rule.mask = true,
                "exp" => rule.export = true,
                "del" => rule.delete = true,
                _ => return None,
            }
        }
        Some((RowId(target), rule))
    }

    /// Pack the rule back into its stored payload form.
    pub fn encode(&self, target: RowId) -> String {
        let mut payload = format!("{}|{}", target.as_u64(), self.level.as_str());
        if self.mask {
            payload.push_str("|mask");
        }
        if self.export {
            payload.push_str("|exp");
        }
        if self.delete {
            payload.push_str("|del");
        }
        payload
    }
}

/// The authenticated caller, as far as this crate is concerned
///
/// Authentication itself happens upstream; the core receives the role row
/// id and the admin flag and asks no further questions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub role: RowId,
    pub admin: bool,
}

impl Principal {
    pub fn role(role: RowId) -> Self {
        Principal { role, admin: false }
    }

    pub fn admin() -> Self {
        Principal {
            role: ROOT,
            admin: true,
        }
    }
}

/// A role's rule map, loaded fresh per request
///
/// No cross-request cache: rule edits take effect immediately, at the cost
/// of one load per check. A shared cache would need explicit invalidation
/// and is not a drop-in change.
#[derive(Debug, Default)]
pub struct GrantSet {
    rules: HashMap<RowId, GrantRule>,
}

impl GrantSet {
    pub fn load<S: RelationStore + ?Sized>(store: &S, role: RowId) -> Result<GrantSet> {
        let mut rules = HashMap::new();
        for row in store.children_of_type(role, BaseType::AccessRule.id())? {
            match GrantRule::parse(&row.value) {
                Some((target, rule)) => {
                    rules.insert(target, rule);
                }
                None => {
                    debug!(rule_row = row.id.as_u64(), "skipping malformed access rule");
                }
            }
        }
        Ok(GrantSet { rules })
    }

    pub fn rule(&self, target: RowId) -> Option<&GrantRule> {
        self.rules.get(&target)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Row kinds whose value payload is configuration, not a data reference;
/// the reference fallback must not fire for them.
fn reference_check_skipped(type_pointer: RowId) -> bool {
    type_pointer == BaseType::ReportColumn.id() || type_pointer == BaseType::ReportJoin.id()
}

/// Permission resolver over a relation store
pub struct GrantResolver<'a, S: RelationStore + ?Sized> {
    store: &'a S,
    config: &'a Config,
}

impl<'a, S: RelationStore + ?Sized> GrantResolver<'a, S> {
    pub fn new(store: &'a S, config: &'a Config) -> Self {
        GrantResolver { store, config }
    }

    /// Decide whether `principal` may access row `id` at `level`.
    ///
    /// `type_id` is the caller's notion of the row's type (0 when unknown);
    /// an explicit rule on it wins before anything else and never falls
    /// through.
    pub fn check_grant(
        &self,
        id: RowId,
        type_id: RowId,
        level: GrantLevel,
        principal: &Principal,
    ) -> bool {
        if principal.admin {
            return true;
        }
        let outcome = GrantSet::load(self.store, principal.role)
            .and_then(|rules| self.check_inner(&rules, id, type_id, level, 0));
        match outcome {
            Ok(granted) => granted,
            Err(err) => {
                warn!(
                    row = id.as_u64(),
                    role = principal.role.as_u64(),
                    error = %err,
                    "grant resolution failed, denying access"
                );
                false
            }
        }
    }

    /// `check_grant` as a typed failure for call sites that propagate.
    pub fn require(
        &self,
        id: RowId,
        type_id: RowId,
        level: GrantLevel,
        principal: &Principal,
    ) -> Result<()> {
        if self.check_grant(id, type_id, level, principal) {
            Ok(())
        } else {
            Err(CoreError::AccessDenied)
        }
    }

    fn check_inner(
        &self,
        rules: &GrantSet,
        id: RowId,
        type_id: RowId,
        level: GrantLevel,
        depth: usize,
    ) -> Result<bool> {
        // Explicit rules resolve terminally: READ never falls through to a
        // broader WRITE somewhere up the graph.
        if type_id != ROOT {
            if let Some(rule) = rules.rule(type_id) {
                return Ok(rule.level.satisfies(level));
            }
        }
        if let Some(rule) = rules.rule(id) {
            return Ok(rule.level.satisfies(level));
        }

        let Some(row) = self.store.get(id)? else {
            return Ok(false);
        };

        // Structural context for the fallback chain.
        let own_type = row.type_pointer;
        let parent_row = if row.parent == ROOT {
            None
        } else {
            self.store.get(row.parent)?
        };
        let parent_type = parent_row.as_ref().map(|p| p.type_pointer);

        // Array membership: when the row is a stored value of some field,
        // its type pointer is the field definition; that field's declared
        // target is the peer type.
        let array_type = match self.store.get(own_type)? {
            Some(field_row) if field_row.parent != ROOT => Some(field_row.type_pointer),
            _ => None,
        };

        let referenced = if reference_check_skipped(own_type) {
            None
        } else {
            row.value_as_reference()
        };

        // Fixed precedence; first matching rule decides.
        let candidates = [
            Some(own_type),
            array_type,
            referenced,
            parent_type,
            (row.parent != ROOT).then_some(row.parent),
        ];
        for candidate in candidates.into_iter().flatten() {
            if let Some(rule) = rules.rule(candidate) {
                return Ok(rule.level.satisfies(level));
            }
        }

        if row.parent != ROOT {
            if depth >= self.config.max_grant_depth {
                warn!(
                    row = id.as_u64(),
                    depth, "grant recursion depth exceeded, denying access"
                );
                return Ok(false);
            }
            return self.check_inner(rules, row.parent, ROOT, level, depth + 1);
        }

        Ok(false)
    }

    /// Root-visibility check used by listings only, never for writes: an
    /// explicit rule on the row or on the root grants it; otherwise the row
    /// is visible when something referencing it sits under a granted type.
    pub fn grant_one_level(&self, id: RowId, principal: &Principal) -> bool {
        if principal.admin {
            return true;
        }
        let outcome = (|| -> Result<bool> {
            let rules = GrantSet::load(self.store, principal.role)?;
            if let Some(rule) = rules.rule(id) {
                return Ok(rule.level.satisfies(GrantLevel::Read));
            }
            if let Some(rule) = rules.rule(ROOT) {
                return Ok(rule.level.satisfies(GrantLevel::Read));
            }
            for referencing in self.store.rows_referencing(id)? {
                let Some(parent) = self.store.get(referencing.parent)? else {
                    continue;
                };
                if let Some(rule) = rules.rule(parent.type_pointer) {
                    if rule.level.satisfies(GrantLevel::Read) {
                        return Ok(true);
                    }
                }
            }
            Ok(false)
        })();
        match outcome {
            Ok(granted) => granted,
            Err(err) => {
                warn!(
                    row = id.as_u64(),
                    error = %err,
                    "one-level grant resolution failed, denying access"
                );
                false
            }
        }
    }
}
