//! Prints the CRD manifests for installation:
//! `cargo run --bin crdgen > deploy/crds.yaml`

use kube::CustomResourceExt;
use qdrant_operator_api::{
    QdrantCluster, QdrantCollection, QdrantCollectionBackup, QdrantCollectionRestore,
    QdrantCollectionTemplate,
};

fn main() -> Result<(), serde_yaml::Error> {
    for crd in [
        QdrantCluster::crd(),
        QdrantCollection::crd(),
        QdrantCollectionTemplate::crd(),
        QdrantCollectionRestore::crd(),
        QdrantCollectionBackup::crd(),
    ] {
        print!("---\n{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
