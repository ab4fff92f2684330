//! Named registry of load balancers.

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::LbError;
use crate::lb::TcpLb;

#[derive(Default)]
pub struct TcpLbHolder {
    lbs: DashMap<String, Arc<TcpLb>>,
}

impl TcpLbHolder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, lb: Arc<TcpLb>) -> Result<(), LbError> {
        match self.lbs.entry(lb.alias().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(LbError::already_exists("tcp-lb", lb.alias())),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(lb);
                Ok(())
            }
        }
    }

    pub fn get(&self, alias: &str) -> Result<Arc<TcpLb>, LbError> {
        self.lbs
            .get(alias)
            .map(|e| e.value().clone())
            .ok_or_else(|| LbError::not_found("tcp-lb", alias))
    }

    /// Remove and destroy the load balancer named `alias`.
    pub fn remove(&self, alias: &str) -> Result<(), LbError> {
        let (_, lb) = self
            .lbs
            .remove(alias)
            .ok_or_else(|| LbError::not_found("tcp-lb", alias))?;
        lb.destroy();
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lbs.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.lbs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lbs.is_empty()
    }

    /// Destroy every registered load balancer.
    pub fn clear(&self) {
        let all: Vec<Arc<TcpLb>> = self.lbs.iter().map(|e| e.value().clone()).collect();
        self.lbs.clear();
        for lb in all {
            lb.destroy();
        }
    }
}
