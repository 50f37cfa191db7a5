//! Pool expansion

use super::{property_args, properties_are_safe, CommandLine, CommandSpec, Stage, ZPOOL};
use crate::validation::{is_safe_token, Predicate};

/// `zpool add [-n] [-o k=v]... pool vdev...`
#[derive(Clone, Debug, Default)]
pub struct PoolExpansion {
    pub pool: String,
    pub devices: Vec<String>,
    pub properties: Vec<(String, String)>,
    pub dry_run: bool,
    checks: Vec<Predicate<PoolExpansion>>,
}

fn pool_set(p: &PoolExpansion) -> bool {
    !p.pool.is_empty()
}

fn devices_set(p: &PoolExpansion) -> bool {
    !p.devices.is_empty()
}

fn names_safe(p: &PoolExpansion) -> bool {
    (p.pool.is_empty() || is_safe_token(&p.pool)) && p.devices.iter().all(|d| is_safe_token(d))
}

fn properties_safe(p: &PoolExpansion) -> bool {
    properties_are_safe(&p.properties)
}

pub const IS_POOL_SET: Predicate<PoolExpansion> = Predicate::new("pool is set", pool_set);
pub const IS_VDEV_SET: Predicate<PoolExpansion> = Predicate::new("vdev is set", devices_set);
const ARE_NAMES_SAFE: Predicate<PoolExpansion> =
    Predicate::new("pool and vdev names are safe arguments", names_safe);
const ARE_PROPERTIES_SAFE: Predicate<PoolExpansion> =
    Predicate::new("properties are safe arguments", properties_safe);

impl PoolExpansion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_check(mut self, check: Predicate<Self>) -> Self {
        self.checks.push(check);
        self
    }

    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = pool.into();
        self
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.devices.push(device.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

impl CommandSpec for PoolExpansion {
    fn operation(&self) -> &'static str {
        "pool expansion"
    }

    fn checks(&self) -> Vec<Predicate<Self>> {
        let mut checks = vec![IS_POOL_SET, IS_VDEV_SET, ARE_NAMES_SAFE, ARE_PROPERTIES_SAFE];
        checks.extend(self.checks.iter().copied());
        checks
    }

    fn assemble(&self) -> CommandLine {
        let stage = Stage::new(ZPOOL).arg("add").arg_if(self.dry_run, "-n");
        let stage = property_args(stage, &self.properties).arg(self.pool.clone());
        let stage = self
            .devices
            .iter()
            .fold(stage, |s, device| s.arg(device.clone()));
        CommandLine::single(stage)
    }
}
