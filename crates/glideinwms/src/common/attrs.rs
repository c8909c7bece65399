//! Ad types and attribute names of the Frontend/Factory protocol.

pub const TYPE_GLIDEFACTORY: &str = "glidefactory";
pub const TYPE_GLIDEFACTORY_GLOBAL: &str = "glidefactoryglobal";
pub const TYPE_GLIDEFACTORY_CLIENT: &str = "glidefactoryclient";
pub const TYPE_GLIDECLIENT: &str = "glideclient";
pub const TYPE_GLIDECLIENT_GLOBAL: &str = "glideclientglobal";
pub const TYPE_GLIDERESOURCE: &str = "glideresource";
pub const TYPE_MACHINE: &str = "Machine";
pub const TYPE_SCHEDULER: &str = "Scheduler";

// glidefactory / glidefactoryglobal
pub const ATTR_FACTORY_NAME: &str = "FactoryName";
pub const ATTR_GLIDEIN_NAME: &str = "GlideinName";
pub const ATTR_ENTRY_NAME: &str = "EntryName";
pub const ATTR_PUB_KEY_ID: &str = "PubKeyID";
pub const ATTR_PUB_KEY_TYPE: &str = "PubKeyType";
pub const ATTR_PUB_KEY_VALUE: &str = "PubKeyValue";
pub const ATTR_SUPPORTED_SIGN_TYPES: &str = "SupportedSignTypes";
pub const ATTR_IN_DOWNTIME: &str = "InDowntime";
pub const ATTR_ENTRY_STATE: &str = "EntryState";
pub const ATTR_TRUST_DOMAIN: &str = "GLIDEIN_TrustDomain";
pub const ATTR_AUTH_METHODS: &str = "GLIDEIN_SupportedAuthenticationMethod";
pub const ATTR_REQUIRE_VOMS: &str = "GLIDEIN_REQUIRE_VOMS";

// glideclient
pub const ATTR_GLIDEIN_MY_TYPE: &str = "GlideinMyType";
pub const ATTR_CLIENT_NAME: &str = "ClientName";
pub const ATTR_FRONTEND_NAME: &str = "FrontendName";
pub const ATTR_GROUP_NAME: &str = "GroupName";
pub const ATTR_REQ_NAME: &str = "ReqName";
pub const ATTR_REQ_GLIDEIN: &str = "ReqGlidein";
pub const ATTR_REQ_IDLE: &str = "ReqIdleGlideins";
pub const ATTR_REQ_MAX: &str = "ReqMaxGlideins";
pub const ATTR_REQ_REMOVE_EXCESS: &str = "ReqRemoveExcess";
pub const ATTR_REQ_REMOVE_EXCESS_MARGIN: &str = "ReqRemoveExcessMargin";
pub const ATTR_REQ_IDLE_LIFETIME: &str = "ReqIdleLifetime";
pub const ATTR_REQ_PUB_KEY_ID: &str = "ReqPubKeyID";
pub const ATTR_REQ_EXPIRES_AT: &str = "ReqExpiresAt";

pub const PREFIX_PARAM: &str = "GlideinParam";
pub const PREFIX_ENC_PARAM: &str = "GlideinEncParam";
pub const PREFIX_MONITOR: &str = "GlideinMonitor";

// Names of the encrypted parameters, used after `GlideinEncParam`.
pub const ENC_SYM_KEY: &str = "SymKey";
pub const ENC_SUBMIT_PROXY: &str = "SubmitProxy";
pub const ENC_SECURITY_CLASS: &str = "SecurityClass";
pub const ENC_SECURITY_NAME: &str = "SecurityName";
pub const ENC_IDENTITY: &str = "Identity";
pub const ENC_CREDENTIAL_TYPE: &str = "CredentialType";

// glidefactoryclient
pub const ATTR_REQ_CLIENT_NAME: &str = "ReqClientName";
pub const ATTR_REQ_CLIENT_REQ_NAME: &str = "ReqClientReqName";
pub const ATTR_CREDENTIAL_ID: &str = "GlideinCredentialIdentifier";
pub const PREFIX_MONITOR_STATUS: &str = "GlideinMonitorStatus";
pub const PREFIX_MONITOR_REQUESTED: &str = "GlideinMonitorRequested";
pub const ATTR_REQ_REJECTED_SIGNATURE: &str = "GlideinMonitorReqRejectedSignature";

// glideresource
pub const ATTR_GLIDE_CLIENT_NAME: &str = "GlideClientName";
pub const ATTR_GLIDE_FRONTEND_NAME: &str = "GlideFrontendName";
pub const ATTR_GLIDE_GROUP_NAME: &str = "GlideGroupName";
pub const ATTR_GLIDE_FACTORY_NAME: &str = "GlideFactoryName";
pub const ATTR_GLIDE_ENTRY_NAME: &str = "GlideEntryName";
pub const ATTR_GLIDEIN_IN_DOWNTIME: &str = "GlideinInDowntime";
pub const ATTR_MATCH_ERRORS: &str = "GlideClientMatchErrors";
pub const PREFIX_CLIENT_MONITOR: &str = "GlideClientMonitor";
pub const PREFIX_CLIENT_LIMIT: &str = "GlideClientLimit";
pub const PREFIX_FACTORY_MONITOR: &str = "GlideFactoryMonitor";

// Machine ads of running pilots
pub const ATTR_GLIDECLIENT_NAME: &str = "GLIDECLIENT_Name";
pub const ATTR_SLOT_ENTRY_NAME: &str = "GLIDEIN_Entry_Name";
pub const ATTR_SLOT_GLIDEIN_NAME: &str = "GLIDEIN_Name";
pub const ATTR_SLOT_FACTORY: &str = "GLIDEIN_Factory";
pub const ATTR_SLOT_CREDENTIAL_ID: &str = "GLIDEIN_CredentialIdentifier";
pub const ATTR_IS_MONITOR_VM: &str = "IS_MONITOR_VM";

/// `<entry>@<glidein>@<factory>`, the name of an Entry across the whole system.
pub fn entry_fullname(entry: &str, glidein: &str, factory: &str) -> String {
    format!("{entry}@{glidein}@{factory}")
}

/// Splits an Entry full name into its entry, glidein and factory parts.
pub fn split_entry_fullname(name: &str) -> Option<(&str, &str, &str)> {
    let mut parts = name.split('@');
    let (Some(entry), Some(glidein), Some(factory), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return None;
    };
    (!entry.is_empty() && !glidein.is_empty() && !factory.is_empty())
        .then_some((entry, glidein, factory))
}

pub fn enc_param(name: &str) -> String {
    format!("{PREFIX_ENC_PARAM}{name}")
}
