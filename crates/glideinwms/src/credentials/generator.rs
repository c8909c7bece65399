use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::time::Duration;

use anyhow::Context;
use bstr::ByteSlice;
use classad::Map;

use crate::credentials::CredentialConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedCredential {
    pub payload: String,
    /// How long the payload may be reused for the same Entry.
    pub lifetime: Duration,
}

pub type GeneratorFuture = Pin<Box<dyn Future<Output = anyhow::Result<GeneratedCredential>>>>;

/// Produces credential content on demand for one Entry.
pub trait CredentialGenerator {
    fn generate(&self, entry: &str, credential: &CredentialConfig) -> GeneratorFuture;
}

/// Runs a command through the shell; its standard output is the credential.
///
/// The command gets the Entry name and the credential id as positional arguments.
pub struct CommandGenerator {
    script: String,
    timeout: Duration,
}

impl CommandGenerator {
    pub fn new(script: String, timeout: Duration) -> Self {
        Self { script, timeout }
    }
}

impl CredentialGenerator for CommandGenerator {
    fn generate(&self, entry: &str, credential: &CredentialConfig) -> GeneratorFuture {
        let script = self.script.clone();
        let timeout = self.timeout;
        let entry = entry.to_string();
        let id = credential.id.clone();
        let lifetime = credential.refresh_frequency;
        Box::pin(async move {
            let output = classad::tools::run_tool(
                &["sh", "-c", &script, "gwms-generator", &entry, &id],
                timeout,
            )
            .await
            .with_context(|| format!("Credential generator of `{id}` failed"))?;
            let payload = output
                .stdout
                .to_str()
                .map_err(|e| anyhow::anyhow!("Invalid UTF-8 generator output: {e:?}"))?
                .trim()
                .to_string();
            if payload.is_empty() {
                anyhow::bail!("Credential generator of `{id}` printed nothing");
            }
            Ok(GeneratedCredential { payload, lifetime })
        })
    }
}

/// Generators by name. Built once at startup and shared read-only afterwards.
#[derive(Default)]
pub struct GeneratorRegistry {
    generators: Map<String, Rc<dyn CredentialGenerator>>,
}

impl GeneratorRegistry {
    pub fn builder() -> GeneratorRegistryBuilder {
        GeneratorRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<Rc<dyn CredentialGenerator>> {
        self.generators.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.generators.contains_key(name)
    }
}

#[derive(Default)]
pub struct GeneratorRegistryBuilder {
    generators: Map<String, Rc<dyn CredentialGenerator>>,
}

impl GeneratorRegistryBuilder {
    pub fn register(mut self, name: &str, generator: Rc<dyn CredentialGenerator>) -> Self {
        if self.generators.insert(name.to_string(), generator).is_some() {
            log::warn!("Credential generator `{name}` registered twice, keeping the last one");
        }
        self
    }

    /// Registers a [`CommandGenerator`] for every credential with a `creation_script`.
    pub fn with_scripts(mut self, credentials: &[CredentialConfig], timeout: Duration) -> Self {
        for credential in credentials {
            if let Some(script) = &credential.creation_script {
                let name = credential
                    .generator
                    .clone()
                    .unwrap_or_else(|| credential.id.clone());
                self = self.register(
                    &name,
                    Rc::new(CommandGenerator::new(script.clone(), timeout)),
                );
            }
        }
        self
    }

    pub fn finish(self) -> GeneratorRegistry {
        GeneratorRegistry {
            generators: self.generators,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{CommandGenerator, CredentialGenerator, GeneratorRegistry};
    use crate::credentials::{CredentialConfig, CredentialType};

    fn script_credential(script: &str) -> CredentialConfig {
        CredentialConfig {
            id: "token1".to_string(),
            cred_type: CredentialType::Generator,
            trust_domain: "Grid".to_string(),
            security_class: "frontend".to_string(),
            files: vec![],
            generator: None,
            generates: Some(CredentialType::Scitoken),
            creation_script: Some(script.to_string()),
            refresh_frequency: Duration::from_secs(120),
        }
    }

    #[tokio::test]
    async fn command_generator_reads_stdout() {
        let credential = script_credential("echo \"token-$1-$2\"");
        let generator = CommandGenerator::new(
            credential.creation_script.clone().unwrap(),
            Duration::from_secs(10),
        );
        let generated = generator.generate("e1@g@f", &credential).await.unwrap();
        assert_eq!(generated.payload, "token-e1@g@f-token1");
        assert_eq!(generated.lifetime, Duration::from_secs(120));
    }

    #[tokio::test]
    async fn command_generator_fails_on_empty_output() {
        let credential = script_credential("true");
        let generator = CommandGenerator::new("true".to_string(), Duration::from_secs(10));
        assert!(generator.generate("e1", &credential).await.is_err());
        let failing = CommandGenerator::new("exit 3".to_string(), Duration::from_secs(10));
        assert!(failing.generate("e1", &credential).await.is_err());
    }

    #[test]
    fn scripts_are_registered_by_credential_id() {
        let credential = script_credential("echo x");
        let registry = GeneratorRegistry::builder()
            .with_scripts(&[credential], Duration::from_secs(1))
            .finish();
        assert!(registry.contains("token1"));
        assert!(!registry.contains("other"));
    }
}
