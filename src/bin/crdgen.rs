//! CRD YAML Generator
//!
//! This binary generates Kubernetes CRD manifests for the job records
//! managed by the cstor-backup-operator.
//!
//! Usage: cargo run --bin crdgen > deploy/crds/all.yaml

use cstor_backup_operator::crd::generate_crds;

fn main() -> Result<(), serde_yaml::Error> {
    for crd in generate_crds()? {
        println!("---");
        print!("{}", crd);
    }
    Ok(())
}
