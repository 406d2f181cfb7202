//! Parameter store with explicit, named scopes.
//!
//! Every learned tensor lives in one `VarStore` under a dotted name
//! `scope.sub.parameter`. A scope is claimed once; opening it again is only
//! allowed as an explicit reuse request, in which case the existing tensors are
//! handed out instead of new ones being created.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use tch::{nn, Device, Tensor};
use tracing::debug;

use crate::error::{NetworkError, Result};

pub struct ParameterStore {
    vs: nn::VarStore,
    claimed: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for ParameterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterStore")
            .field("device", &self.vs.device())
            .field("variables", &self.vs.len())
            .finish()
    }
}

impl ParameterStore {
    pub fn new(device: Device) -> Self {
        Self { vs: nn::VarStore::new(device), claimed: Mutex::new(HashSet::new()) }
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    /// Opens the scope `name`.
    ///
    /// Without `reuse` the scope must be unclaimed and gets claimed; with
    /// `reuse` it must already exist and its parameters are shared.
    pub fn scope(&self, name: &str, reuse: bool) -> Result<Scope<'_>> {
        check_name(name)?;
        let mut claimed = self.claimed.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match (claimed.contains(name), reuse) {
            (true, false) => return Err(NetworkError::ScopeCollision(name.to_string())),
            (false, true) => return Err(NetworkError::UnknownScope(name.to_string())),
            (false, false) => {
                claimed.insert(name.to_string());
                debug!(scope = name, "claimed parameter scope");
            }
            (true, true) => debug!(scope = name, "reusing parameter scope"),
        }
        Ok(Scope {
            store: self,
            path: self.vs.root().sub(name),
            prefix: name.to_string(),
            reuse,
        })
    }

    /// Number of parameter tensors.
    pub fn len(&self) -> usize {
        self.vs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vs.is_empty()
    }

    /// Total number of scalar parameters.
    pub fn parameter_count(&self) -> usize {
        self.vs.variables().values().map(|t| t.numel()).sum()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.vs.save(path)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.vs.load(path)?;
        Ok(())
    }
}

/// Scope and parameter names become one component of a dotted `VarStore` key.
fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('.') {
        return Err(NetworkError::InvalidConfig(format!(
            "name {name:?} must be non-empty and must not contain '.'"
        )));
    }
    Ok(())
}

/// A named region of the parameter store.
#[derive(Debug)]
pub struct Scope<'a> {
    store: &'a ParameterStore,
    path: nn::Path<'a>,
    prefix: String,
    reuse: bool,
}

impl<'a> Scope<'a> {
    pub fn sub(&self, name: &str) -> Result<Scope<'a>> {
        check_name(name)?;
        Ok(Scope {
            store: self.store,
            path: self.path.sub(name),
            prefix: format!("{}.{}", self.prefix, name),
            reuse: self.reuse,
        })
    }

    pub fn name(&self) -> &str {
        &self.prefix
    }

    /// Creates the parameter `name`, or fetches it when the scope is reused.
    pub fn param(&self, name: &str, dims: &[i64], init: nn::Init) -> Result<Tensor> {
        check_name(name)?;
        if !self.reuse {
            return Ok(self.path.var(name, dims, init));
        }
        let full_name = format!("{}.{}", self.prefix, name);
        let variables = self.store.vs.variables();
        let tensor = variables
            .get(&full_name)
            .ok_or_else(|| NetworkError::MissingParameter(full_name.clone()))?;
        if tensor.size() != dims {
            return Err(NetworkError::ParameterShape {
                name: full_name,
                expected: dims.to_vec(),
                found: tensor.size(),
            });
        }
        Ok(tensor.shallow_clone())
    }
}
