//! Secret visitor for SDS: one Envoy secret per distinct certificate.

use std::collections::BTreeMap;

use envoy_types::pb::envoy::config::core::v3::{data_source::Specifier, DataSource};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    secret, Secret, TlsCertificate,
};
use tracing::debug;

use crate::config::TranslatorConfig;
use crate::dag::{self, Dag, Vertex};
use crate::xds::naming::secret_name;

/// Build every secret referenced by a secure virtual host, keyed by name.
pub fn visit_secrets(config: &TranslatorConfig, dag: &Dag) -> BTreeMap<String, Secret> {
    let mut secrets = BTreeMap::new();
    dag.visit(|vertex| collect(config, vertex, &mut secrets));
    secrets
}

fn collect(config: &TranslatorConfig, vertex: Vertex<'_>, secrets: &mut BTreeMap<String, Secret>) {
    if let Vertex::Secret(source) = vertex {
        let name = secret_name(&config.naming, source);
        if !secrets.contains_key(&name) {
            debug!(
                secret = %name,
                source = %format!("{}/{}", source.namespace, source.name),
                "building secret"
            );
            let built = build_secret(&name, source);
            secrets.insert(name, built);
        }
    }
    vertex.visit_children(|child| collect(config, child, secrets));
}

fn build_secret(name: &str, source: &dag::Secret) -> Secret {
    Secret {
        name: name.to_string(),
        r#type: Some(secret::Type::TlsCertificate(TlsCertificate {
            certificate_chain: Some(inline_bytes(&source.certificate_chain)),
            private_key: Some(inline_bytes(&source.private_key)),
            ..Default::default()
        })),
    }
}

fn inline_bytes(bytes: &[u8]) -> DataSource {
    DataSource { specifier: Some(Specifier::InlineBytes(bytes.to_vec())), ..Default::default() }
}
