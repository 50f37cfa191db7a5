use super::{CommandLine, CommandSpec, Stage, ZFS};
use crate::validation::{is_safe_token, Predicate};

/// `zfs destroy [-n] [-R] name`
#[derive(Clone, Debug, Default)]
pub struct VolumeDestroy {
    pub name: String,
    pub recursive: bool,
    pub dry_run: bool,
    checks: Vec<Predicate<VolumeDestroy>>,
}

fn name_set(d: &VolumeDestroy) -> bool {
    !d.name.is_empty()
}

fn name_safe(d: &VolumeDestroy) -> bool {
    d.name.is_empty() || is_safe_token(&d.name)
}

pub const IS_NAME_SET: Predicate<VolumeDestroy> = Predicate::new("name is set", name_set);
const IS_NAME_SAFE: Predicate<VolumeDestroy> = Predicate::new("name is a safe argument", name_safe);

impl VolumeDestroy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_check(mut self, check: Predicate<Self>) -> Self {
        self.checks.push(check);
        self
    }

    /// Dataset, volume or `dataset@snapshot`
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Also destroy dependents, clones included
    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

impl CommandSpec for VolumeDestroy {
    fn operation(&self) -> &'static str {
        "destroy"
    }

    fn checks(&self) -> Vec<Predicate<Self>> {
        let mut checks = vec![IS_NAME_SET, IS_NAME_SAFE];
        checks.extend(self.checks.iter().copied());
        checks
    }

    fn assemble(&self) -> CommandLine {
        CommandLine::single(
            Stage::new(ZFS)
                .arg("destroy")
                .arg_if(self.dry_run, "-n")
                .arg_if(self.recursive, "-R")
                .arg(self.name.clone()),
        )
    }
}
