use super::{CommandLine, CommandSpec, Stage, ZPOOL};
use crate::validation::{is_safe_token, Predicate};

/// `zpool status [pool]`; without a pool every pool is reported
#[derive(Clone, Debug, Default)]
pub struct PoolStatus {
    pub pool: Option<String>,
    checks: Vec<Predicate<PoolStatus>>,
}

fn pool_safe(p: &PoolStatus) -> bool {
    p.pool.as_deref().map_or(true, is_safe_token)
}

const IS_POOL_SAFE: Predicate<PoolStatus> = Predicate::new("pool name is a safe argument", pool_safe);

impl PoolStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_check(mut self, check: Predicate<Self>) -> Self {
        self.checks.push(check);
        self
    }

    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = Some(pool.into());
        self
    }
}

impl CommandSpec for PoolStatus {
    fn operation(&self) -> &'static str {
        "pool status"
    }

    fn checks(&self) -> Vec<Predicate<Self>> {
        let mut checks = vec![IS_POOL_SAFE];
        checks.extend(self.checks.iter().copied());
        checks
    }

    fn assemble(&self) -> CommandLine {
        let stage = Stage::new(ZPOOL).arg("status");
        CommandLine::single(match &self.pool {
            Some(pool) => stage.arg(pool.clone()),
            None => stage,
        })
    }
}
