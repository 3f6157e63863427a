//! Contract ownership resolution.
//!
//! A contract's funds belong to whoever ultimately controls it: follow
//! `admin` (or `creator` when there is no usable admin) until reaching an
//! address that is not a contract. Visited addresses are tracked so a
//! cycle fails instead of looping.

use std::collections::HashSet;

use tracing::warn;

use crate::error::{ResolveError, ResolveResult};
use crate::models::{ContractInfo, OrderedMap};

/// Maximum length of an ownership chain.
pub const MAX_RESOLUTION_DEPTH: usize = 50;

/// Resolves contract addresses to their controlling non-contract address.
pub struct ContractOwnershipResolver<'a> {
    contracts: &'a OrderedMap<String, ContractInfo>,
    fallback: Option<String>,
    max_depth: usize,
}

impl<'a> ContractOwnershipResolver<'a> {
    pub fn new(contracts: &'a OrderedMap<String, ContractInfo>) -> Self {
        Self {
            contracts,
            fallback: None,
            max_depth: MAX_RESOLUTION_DEPTH,
        }
    }

    /// Address that receives funds of contracts with neither admin nor
    /// creator. Cycles and overlong chains stay fatal.
    pub fn with_fallback(mut self, fallback: Option<String>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn is_contract(&self, address: &str) -> bool {
        self.contracts.contains_key(address)
    }

    /// Resolve `address`. A non-contract address resolves to itself.
    pub fn resolve(&self, address: &str) -> ResolveResult<String> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut current = address;

        while let Some(info) = self.contracts.get(current) {
            if !visited.insert(current) {
                return Err(ResolveError::ContractCycle {
                    start: address.to_string(),
                    revisited: current.to_string(),
                });
            }
            if visited.len() > self.max_depth {
                return Err(ResolveError::DepthExceeded {
                    start: address.to_string(),
                    limit: self.max_depth,
                });
            }

            let admin = info.admin.as_deref().filter(|a| !a.is_empty() && *a != current);
            let creator = info.creator.as_deref().filter(|c| !c.is_empty());
            current = match admin.or(creator) {
                Some(next) => next,
                None => {
                    return match &self.fallback {
                        Some(fallback) => {
                            warn!(contract = %current, fallback = %fallback, "⚠️ Orphan contract, using fallback owner");
                            Ok(fallback.clone())
                        }
                        None => Err(ResolveError::OrphanContract(current.to_string())),
                    };
                }
            };
        }

        Ok(current.to_string())
    }
}
