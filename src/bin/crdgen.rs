//! CRD YAML Generator
//!
//! Prints the StorageVolume CRD manifest.
//!
//! Usage: cargo run --bin crdgen > deploy/crds/storagevolume.yaml

use kube::CustomResourceExt;

use storage_volume_operator::crd::StorageVolume;

fn main() {
    match serde_yaml::to_string(&StorageVolume::crd()) {
        Ok(yaml) => print!("{}", yaml),
        Err(e) => {
            eprintln!("Failed to serialize CRD: {}", e);
            std::process::exit(1);
        }
    }
}
