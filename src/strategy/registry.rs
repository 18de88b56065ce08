//! Process-wide strategy discovery.
//!
//! The registry is built once at startup (write-once, read-only afterwards)
//! and passed down as an explicit context object. Built-in strategies are
//! seeded by [`StrategyRegistry::with_builtins`]; external callers add their
//! own through [`StrategyRegistry::register`].

use std::collections::BTreeMap;

use crate::error::ConfigError;
use crate::market::series::SeriesKind;
use crate::strategy::params::{ParameterSpec, Params};
use crate::strategy::{builtin, DataRequirement, StrategyInstance, StrategyMetadata};

type BuildFn = Box<dyn Fn(&Params) -> Result<StrategyInstance, ConfigError> + Send + Sync>;
type ValidateFn = Box<dyn Fn(&Params) -> Result<(), ConfigError> + Send + Sync>;

/// Everything the registry knows about one strategy.
pub struct StrategyDef {
    pub id: String,
    pub metadata: StrategyMetadata,
    pub parameters: BTreeMap<String, ParameterSpec>,
    pub requirements: Vec<DataRequirement>,
    build: BuildFn,
    validate: Option<ValidateFn>,
}

impl StrategyDef {
    pub fn new(
        id: &str,
        metadata: StrategyMetadata,
        parameters: BTreeMap<String, ParameterSpec>,
        requirements: Vec<DataRequirement>,
        build: BuildFn,
    ) -> Self {
        Self {
            id: id.to_string(),
            metadata,
            parameters,
            requirements,
            build,
            validate: None,
        }
    }

    pub fn with_validator(mut self, validate: ValidateFn) -> Self {
        self.validate = Some(validate);
        self
    }

    /// Merge defaults with `overrides`, coercing and bounds-checking each
    /// value, then run the strategy's cross-parameter validator.
    pub fn resolve_params(&self, overrides: &Params) -> Result<Params, ConfigError> {
        let mut resolved: Params = self
            .parameters
            .iter()
            .map(|(name, spec)| (name.clone(), spec.default.clone()))
            .collect();

        for (name, value) in overrides.iter() {
            let spec = self
                .parameters
                .get(name)
                .ok_or_else(|| ConfigError::InvalidParameter {
                    name: name.clone(),
                    detail: format!("not declared by strategy {}", self.id),
                })?;
            resolved.set(name, spec.coerce(name, value)?);
        }

        if let Some(validate) = &self.validate {
            validate(&resolved)?;
        }
        Ok(resolved)
    }

    /// Build an instance from resolved parameters.
    pub fn build(&self, params: &Params) -> Result<StrategyInstance, ConfigError> {
        (self.build)(params)
    }
}

impl std::fmt::Debug for StrategyDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyDef")
            .field("id", &self.id)
            .field("parameters", &self.parameters.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct StrategyRegistry {
    defs: BTreeMap<String, StrategyDef>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in strategies.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for def in builtin::all() {
            registry
                .register(def)
                .expect("built-in strategy definitions are valid");
        }
        registry
    }

    pub fn register(&mut self, def: StrategyDef) -> Result<(), ConfigError> {
        match def.requirements.first() {
            Some(req) if req.source == SeriesKind::Ohlcv => {}
            _ => {
                return Err(ConfigError::Invalid(format!(
                    "strategy {}: first data requirement must be OHLCV",
                    def.id
                )))
            }
        }
        if self.defs.contains_key(&def.id) {
            return Err(ConfigError::Invalid(format!(
                "strategy id already registered: {}",
                def.id
            )));
        }
        self.defs.insert(def.id.clone(), def);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<&StrategyDef, ConfigError> {
        self.defs
            .get(id)
            .ok_or_else(|| ConfigError::UnknownStrategy(id.to_string()))
    }

    /// `(id, metadata)` pairs in deterministic id order.
    pub fn list(&self) -> impl Iterator<Item = (&str, &StrategyMetadata)> {
        self.defs.iter().map(|(id, def)| (id.as_str(), &def.metadata))
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// Resolve parameters and build in one step.
    pub fn build(
        &self,
        id: &str,
        overrides: &Params,
    ) -> Result<(StrategyInstance, Params), ConfigError> {
        let def = self.get(id)?;
        let params = def.resolve_params(overrides)?;
        let instance = def.build(&params)?;
        Ok((instance, params))
    }
}
