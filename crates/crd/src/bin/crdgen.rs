//! Generates yaml CRD resources from rust code.
//! By default this will target the helm chart's `crds` directory!
//! Designed to be used inside of a mise command that sets the `CRDS_DIR` environment variable.
use std::{fs::File, io::Write, path};

use kube::CustomResourceExt;
use policyward_crd::{Stack, System};

#[allow(clippy::unwrap_used)]
fn main() {
    let crds_dir = std::env::var_os("CRDS_DIR").unwrap();

    for (file_name, crd) in [
        ("system-crd.yaml", System::crd()),
        ("stack-crd.yaml", Stack::crd()),
    ] {
        let schema = serde_yaml::to_string(&crd).unwrap();
        let mut file = File::create(path::Path::new(&crds_dir).join(file_name)).unwrap();
        file.write_all(schema.as_bytes()).unwrap();
    }
}
