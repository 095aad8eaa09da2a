//! ---
//! hm_section: "02-protocol-engine"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Device protocol translation engine."
//! hm_version: "v0.1.0"
//! hm_owner: "tbd"
//! ---
//! Declarative device definitions and the family registry.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;

use crate::control::ControlTable;
use crate::discovery::EntityDescriptor;
use crate::field::{FieldDefinition, TimeWindowField, TokenMap};
use crate::store::DeviceState;
use crate::{DefinitionError, EngineCondition};

/// Predicate deciding whether a payload belongs to a message definition.
pub type MessagePredicate = Arc<dyn Fn(&TokenMap) -> bool + Send + Sync>;

/// Derived, non-wire information (model, firmware, ...).
pub type AuxiliaryInfo = BTreeMap<String, String>;

/// Function computing [`AuxiliaryInfo`] from accumulated state.
pub type AuxiliaryDeriver = Arc<dyn Fn(&DeviceState) -> AuxiliaryInfo + Send + Sync>;

/// Predicate matching payloads whose `key` equals `value`, e.g. `cd=1`.
pub fn discriminator(
    key: &'static str,
    value: &'static str,
) -> impl Fn(&TokenMap) -> bool + Send + Sync + 'static {
    move |tokens| tokens.get(key).map(String::as_str) == Some(value)
}

/// Predicate matching payloads carrying every listed key.
pub fn has_keys(
    keys: &'static [&'static str],
) -> impl Fn(&TokenMap) -> bool + Send + Sync + 'static {
    move |tokens| keys.iter().all(|key| tokens.contains_key(*key))
}

/// One message kind of a family: its match predicate, field table and polling.
#[derive(Clone)]
pub struct MessageDefinition {
    name: String,
    is_match: MessagePredicate,
    fields: Vec<FieldDefinition>,
    time_windows: Vec<TimeWindowField>,
    publish_slot: String,
    poll_interval: Duration,
    refresh_payload: String,
}

impl MessageDefinition {
    /// New definition. The publish slot defaults to `name`.
    pub fn new<F>(
        name: impl Into<String>,
        is_match: F,
        poll_interval: Duration,
        refresh_payload: impl Into<String>,
    ) -> Self
    where
        F: Fn(&TokenMap) -> bool + Send + Sync + 'static,
    {
        let name = name.into();
        Self {
            publish_slot: name.clone(),
            name,
            is_match: Arc::new(is_match),
            fields: Vec::new(),
            time_windows: Vec::new(),
            poll_interval,
            refresh_payload: refresh_payload.into(),
        }
    }

    /// Override the slot the decoded record is published under.
    pub fn with_publish_slot(mut self, slot: impl Into<String>) -> Self {
        self.publish_slot = slot.into();
        self
    }

    /// Append a field definition.
    pub fn with_field(mut self, field: FieldDefinition) -> Self {
        self.fields.push(field);
        self
    }

    /// Append several field definitions.
    pub fn with_fields(mut self, fields: impl IntoIterator<Item = FieldDefinition>) -> Self {
        self.fields.extend(fields);
        self
    }

    /// Append an indexed time-window field.
    pub fn with_time_windows(mut self, windows: TimeWindowField) -> Self {
        self.time_windows.push(windows);
        self
    }

    /// Message name, used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the payload belongs to this message.
    pub fn matches(&self, tokens: &TokenMap) -> bool {
        (self.is_match)(tokens)
    }

    /// Field definitions in declaration order.
    pub fn fields(&self) -> &[FieldDefinition] {
        &self.fields
    }

    /// Time-window fields.
    pub fn time_windows(&self) -> &[TimeWindowField] {
        &self.time_windows
    }

    /// Key within device state the decoded record is stored under.
    pub fn publish_slot(&self) -> &str {
        &self.publish_slot
    }

    /// Minimum spacing between refresh requests.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Wire payload asking the device to report this message.
    pub fn refresh_payload(&self) -> &str {
        &self.refresh_payload
    }
}

impl fmt::Debug for MessageDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageDefinition")
            .field("name", &self.name)
            .field("publish_slot", &self.publish_slot)
            .field("fields", &self.fields.len())
            .field("poll_interval", &self.poll_interval)
            .field("refresh_payload", &self.refresh_payload)
            .finish()
    }
}

/// Everything the engine knows about one device family.
#[derive(Clone)]
pub struct DeviceDefinition {
    family: String,
    messages: Vec<MessageDefinition>,
    derive_aux: Option<AuxiliaryDeriver>,
    controls: ControlTable,
    entities: Vec<EntityDescriptor>,
}

impl DeviceDefinition {
    /// Family definition without messages.
    pub fn new(family: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            messages: Vec::new(),
            derive_aux: None,
            controls: ControlTable::default(),
            entities: Vec::new(),
        }
    }

    /// Append a message definition. Order determines the scheduler slot index.
    pub fn with_message(mut self, message: MessageDefinition) -> Self {
        self.messages.push(message);
        self
    }

    /// Install the auxiliary info deriver.
    pub fn with_auxiliary<F>(mut self, derive: F) -> Self
    where
        F: Fn(&DeviceState) -> AuxiliaryInfo + Send + Sync + 'static,
    {
        self.derive_aux = Some(Arc::new(derive));
        self
    }

    /// Install the control table.
    pub fn with_controls(mut self, controls: ControlTable) -> Self {
        self.controls = controls;
        self
    }

    /// Append discovery entities.
    pub fn with_entities(mut self, entities: impl IntoIterator<Item = EntityDescriptor>) -> Self {
        self.entities.extend(entities);
        self
    }

    /// Family identifier.
    pub fn family(&self) -> &str {
        &self.family
    }

    /// Message definitions in slot order.
    pub fn messages(&self) -> &[MessageDefinition] {
        &self.messages
    }

    /// Control table.
    pub fn controls(&self) -> &ControlTable {
        &self.controls
    }

    /// Declared discovery entities.
    pub fn entities(&self) -> &[EntityDescriptor] {
        &self.entities
    }

    /// Auxiliary info for `state`; empty when the family derives none.
    pub fn auxiliary_info(&self, state: &DeviceState) -> AuxiliaryInfo {
        self.derive_aux
            .as_ref()
            .map(|derive| derive(state))
            .unwrap_or_default()
    }
}

impl fmt::Debug for DeviceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceDefinition")
            .field("family", &self.family)
            .field("messages", &self.messages)
            .field("controls", &self.controls.suffixes().collect::<Vec<_>>())
            .finish()
    }
}

/// Immutable mapping from family identifier to definition.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    families: IndexMap<String, Arc<DeviceDefinition>>,
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a family definition.
    pub fn register(&mut self, definition: DeviceDefinition) -> Result<(), DefinitionError> {
        let family = definition.family().to_owned();
        if definition.messages().is_empty() {
            return Err(DefinitionError::EmptyFamily(family));
        }
        if self.families.contains_key(&family) {
            return Err(DefinitionError::DuplicateFamily(family));
        }
        self.families.insert(family, Arc::new(definition));
        Ok(())
    }

    /// Definition for `family`, if registered.
    pub fn get(&self, family: &str) -> Option<&Arc<DeviceDefinition>> {
        self.families.get(family)
    }

    /// Definition for `family` or [`EngineCondition::UnknownFamily`].
    pub fn require(&self, family: &str) -> Result<&Arc<DeviceDefinition>, EngineCondition> {
        self.get(family).ok_or_else(|| EngineCondition::UnknownFamily {
            family: family.to_owned(),
        })
    }

    /// Registered family identifiers in registration order.
    pub fn families(&self) -> impl Iterator<Item = &str> {
        self.families.keys().map(String::as_str)
    }

    /// Auxiliary info for a device of `family` in `state`.
    pub fn derive_auxiliary_info(
        &self,
        family: &str,
        state: &DeviceState,
    ) -> Result<AuxiliaryInfo, EngineCondition> {
        Ok(self.require(family)?.auxiliary_info(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(pairs: &[(&str, &str)]) -> TokenMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    fn family(name: &str) -> DeviceDefinition {
        DeviceDefinition::new(name).with_message(MessageDefinition::new(
            "data",
            discriminator("cd", "1"),
            Duration::from_secs(60),
            "cd=1",
        ))
    }

    #[test]
    fn predicates_match_discriminator_and_keys() {
        let by_code = discriminator("cd", "14");
        assert!(by_code(&tokens(&[("cd", "14"), ("b_soc", "80")])));
        assert!(!by_code(&tokens(&[("cd", "1")])));

        let by_keys = has_keys(&["pe", "kn"]);
        assert!(by_keys(&tokens(&[("pe", "50"), ("kn", "300")])));
        assert!(!by_keys(&tokens(&[("pe", "50")])));
    }

    #[test]
    fn register_rejects_duplicates_and_empty_families() {
        let mut registry = Registry::new();
        registry.register(family("HMG")).expect("first registration");
        assert_eq!(
            registry.register(family("HMG")),
            Err(DefinitionError::DuplicateFamily("HMG".into()))
        );
        assert_eq!(
            registry.register(DeviceDefinition::new("EMPTY")),
            Err(DefinitionError::EmptyFamily("EMPTY".into()))
        );
        assert_eq!(registry.families().collect::<Vec<_>>(), vec!["HMG"]);
    }

    #[test]
    fn require_reports_unknown_family() {
        let registry = Registry::new();
        assert_eq!(
            registry.require("HMX").map(|_| ()),
            Err(EngineCondition::UnknownFamily { family: "HMX".into() })
        );
    }

    #[test]
    fn auxiliary_info_defaults_to_empty() {
        let mut registry = Registry::new();
        registry.register(family("HMG")).expect("register");
        let info = registry
            .derive_auxiliary_info("HMG", &DeviceState::default())
            .expect("known family");
        assert!(info.is_empty());
    }
}
