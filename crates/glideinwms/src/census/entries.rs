use std::borrow::Cow;

use classad::expr::entry_cpus;
use classad::{ClassAd, EvalValue, Record};

use crate::common::attrs::{
    ATTR_AUTH_METHODS, ATTR_ENTRY_NAME, ATTR_FACTORY_NAME, ATTR_GLIDEIN_NAME, ATTR_IN_DOWNTIME,
    ATTR_PUB_KEY_VALUE, ATTR_REQUIRE_VOMS, ATTR_TRUST_DOMAIN, split_entry_fullname,
};
use crate::common::error::GwmsError;
use crate::credentials::{CredentialType, DEFAULT_TRUST_DOMAIN};
use crate::crypto::EntryPublicKey;

/// One Entry as advertised by its Factory in a `glidefactory` ad.
#[derive(Debug, Clone)]
pub struct EntryDescription {
    /// `<entry>@<glidein>@<factory>`
    pub name: String,
    pub entry_name: String,
    pub glidein_name: String,
    pub factory_name: String,
    /// Collector where the Factory advertises the Entry and reads requests.
    pub factory_pool: String,
    /// Identity the Factory authenticated with.
    pub identity: String,
    pub attrs: ClassAd,
    /// `None` when the Entry advertises no usable key; no requests can be sent to it.
    pub public_key: Option<EntryPublicKey>,
    pub trust_domain: String,
    pub auth_methods: Vec<CredentialType>,
    pub in_downtime: bool,
    pub cpus: i64,
    pub require_voms: bool,
}

impl EntryDescription {
    pub fn from_ad(factory_pool: &str, ad: ClassAd) -> crate::Result<Self> {
        let name = ad.name().to_string();
        let (entry_name, glidein_name, factory_name) = match split_entry_fullname(&name) {
            Some((entry, glidein, factory)) => {
                (entry.to_string(), glidein.to_string(), factory.to_string())
            }
            None => {
                let attr = |key: &str| {
                    ad.get_str(key).map(str::to_string).ok_or_else(|| {
                        GwmsError::GenericError(format!("Entry ad `{name}` has no {key}"))
                    })
                };
                (
                    attr(ATTR_ENTRY_NAME)?,
                    attr(ATTR_GLIDEIN_NAME)?,
                    attr(ATTR_FACTORY_NAME)?,
                )
            }
        };
        let public_key = match ad.get_str(ATTR_PUB_KEY_VALUE) {
            Some(pem) => match EntryPublicKey::from_pem(pem) {
                Ok(key) => Some(key),
                Err(error) => {
                    log::warn!("Entry {name} advertises an unusable public key: {error}");
                    None
                }
            },
            None => None,
        };
        Ok(Self {
            entry_name,
            glidein_name,
            factory_name,
            factory_pool: factory_pool.to_string(),
            identity: ad.authenticated_identity().unwrap_or_default().to_string(),
            public_key,
            trust_domain: ad
                .get_str(ATTR_TRUST_DOMAIN)
                .unwrap_or(DEFAULT_TRUST_DOMAIN)
                .to_string(),
            auth_methods: ad
                .get_str(ATTR_AUTH_METHODS)
                .map(CredentialType::parse_list)
                .unwrap_or_default(),
            in_downtime: ad.get_bool(ATTR_IN_DOWNTIME).unwrap_or(false),
            cpus: entry_cpus(&ad),
            require_voms: ad.get_bool(ATTR_REQUIRE_VOMS).unwrap_or(false),
            attrs: ad,
            name,
        })
    }
}

/// The `glidein` record of match expressions: the Entry attributes, also reachable as
/// `glidein["attrs"]`.
impl Record for EntryDescription {
    fn lookup(&self, name: &str) -> Option<EvalValue<'_>> {
        match name {
            "attrs" => Some(EvalValue::Record(&self.attrs)),
            "name" => Some(EvalValue::Str(Cow::Borrowed(&self.name))),
            _ => self.attrs.lookup(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use classad::{ClassAd, EvalValue, Expression, Record, Scope};

    use super::EntryDescription;
    use crate::credentials::CredentialType;
    use crate::tests::utils::entry_key;

    fn ad() -> ClassAd {
        ClassAd::new("glidefactory", "ce1@gfactory@f1")
            .with("AuthenticatedIdentity", "factory@example.org")
            .with("GLIDEIN_SupportedAuthenticationMethod", "grid_proxy,scitoken")
            .with("GLIDEIN_CPUS", 8)
            .with("GLIDEIN_Site", "Site1")
            .with("InDowntime", "True")
            .with("PubKeyValue", entry_key().public().pem())
    }

    #[test]
    fn description_from_ad() {
        let entry = EntryDescription::from_ad("wms", ad()).unwrap();
        assert_eq!(entry.entry_name, "ce1");
        assert_eq!(entry.glidein_name, "gfactory");
        assert_eq!(entry.factory_name, "f1");
        assert_eq!(entry.identity, "factory@example.org");
        assert_eq!(entry.trust_domain, "Grid");
        assert_eq!(
            entry.auth_methods,
            vec![CredentialType::GridProxy, CredentialType::Scitoken]
        );
        assert_eq!(entry.cpus, 8);
        assert!(entry.in_downtime);
        assert!(!entry.require_voms);
        assert_eq!(entry.public_key.unwrap().id(), entry_key().public().id());
    }

    #[test]
    fn broken_key_makes_entry_keyless() {
        let entry =
            EntryDescription::from_ad("wms", ad().with("PubKeyValue", "not a key")).unwrap();
        assert!(entry.public_key.is_none());
    }

    #[test]
    fn name_from_attributes() {
        let ad = ClassAd::new("glidefactory", "weird")
            .with("EntryName", "e")
            .with("GlideinName", "g")
            .with("FactoryName", "f");
        let entry = EntryDescription::from_ad("wms", ad).unwrap();
        assert_eq!((entry.entry_name.as_str(), entry.factory_name.as_str()), ("e", "f"));
        assert!(EntryDescription::from_ad("wms", ClassAd::new("glidefactory", "weird")).is_err());
    }

    #[test]
    fn glidein_record() {
        let entry = EntryDescription::from_ad("wms", ad()).unwrap();
        assert!(matches!(entry.lookup("attrs"), Some(EvalValue::Record(_))));
        let expr =
            Expression::parse("glidein[\"attrs\"][\"GLIDEIN_Site\"] == \"Site1\" && glidein.GLIDEIN_CPUS == 8")
                .unwrap();
        let scope = Scope::strict().bind_record("glidein", &entry);
        assert!(expr.eval_bool(&scope).unwrap());
    }
}
