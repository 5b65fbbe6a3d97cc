#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]
//! Api contains the data model for resource graph compositions: the symbolic
//! reference types, the expression IR, the manifest envelope, the pluggable
//! schema surface, the narrow cluster-client interface, and the `kro.run`
//! ResourceGraphDefinition types.

pub mod client;
pub mod expr;
pub mod reference;
pub mod resource;
pub mod schema;
pub mod v1alpha1;

/// GROUP is the kubernetes API group of the Kro controller.
pub static GROUP: &str = "kro.run";

#[cfg(test)]
mod tests {
    use super::*;

    use kube::core::Resource;

    #[test]
    fn dummy() {
        println!("kind = {}", v1alpha1::ResourceGraphDefinition::kind(&()));
        println!("group = {}", v1alpha1::ResourceGraphDefinition::group(&()));
    }
}
