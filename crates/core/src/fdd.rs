//! Federation Object Model catalog.
//!
//! The FDD is fixed when a federation execution is created. It maps class,
//! attribute and parameter names to handles and records the delivery order
//! of each attribute and interaction class. Every object class carries the
//! implicit `HLAprivilegeToDeleteObject` attribute as handle `1`.
//!
//! A catalog is assembled with [`FddBuilder`] or parsed from TOML:
//!
//! ```toml
//! [[object_classes]]
//! name = "Vehicle"
//! attributes = [
//!     { name = "position", order = "TimeStamp" },
//!     { name = "callsign" },
//! ]
//!
//! [[interaction_classes]]
//! name = "Collision"
//! order = "TimeStamp"
//! parameters = ["force"]
//! ```

use crate::handles::{AttributeHandle, InteractionClassHandle, ObjectClassHandle, ParameterHandle};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Name of the implicit delete-privilege attribute.
pub const PRIVILEGE_TO_DELETE_OBJECT: &str = "HLAprivilegeToDeleteObject";

/// Handle of the implicit delete-privilege attribute in every object class.
pub const PRIVILEGE_TO_DELETE: AttributeHandle = AttributeHandle(1);

/// Message delivery order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OrderType {
    /// Delivered as soon as it is sent.
    #[default]
    Receive,
    /// Delivered in timestamp order to time-constrained federates.
    TimeStamp,
}

/// Errors raised by FDD construction and lookup.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum FddError {
    #[error("Object class not defined: {0}")]
    ObjectClassNotDefined(ObjectClassHandle),

    #[error("Attribute {attribute} not defined in object class {class}")]
    AttributeNotDefined {
        class: ObjectClassHandle,
        attribute: AttributeHandle,
    },

    #[error("Interaction class not defined: {0}")]
    InteractionClassNotDefined(InteractionClassHandle),

    #[error("Parameter {parameter} not defined in interaction class {class}")]
    InteractionParameterNotDefined {
        class: InteractionClassHandle,
        parameter: ParameterHandle,
    },

    #[error("Name not found: {0}")]
    NameNotFound(String),

    #[error("Duplicate name: {0}")]
    DuplicateName(String),

    #[error("Could not parse FDD: {0}")]
    Parse(String),
}

/// An attribute of an object class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDefinition {
    pub handle: AttributeHandle,
    pub name: String,
    pub order: OrderType,
}

/// An object class and its attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectClass {
    pub handle: ObjectClassHandle,
    pub name: String,
    pub attributes: Vec<AttributeDefinition>,
}

impl ObjectClass {
    /// Look up an attribute by handle.
    pub fn attribute(&self, handle: AttributeHandle) -> Option<&AttributeDefinition> {
        self.attributes.iter().find(|a| a.handle == handle)
    }

    /// Look up an attribute handle by name.
    pub fn attribute_handle(&self, name: &str) -> Option<AttributeHandle> {
        self.attributes.iter().find(|a| a.name == name).map(|a| a.handle)
    }

    /// Every attribute handle of the class, delete privilege included.
    pub fn attribute_handles(&self) -> impl Iterator<Item = AttributeHandle> + '_ {
        self.attributes.iter().map(|a| a.handle)
    }
}

/// A parameter of an interaction class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterDefinition {
    pub handle: ParameterHandle,
    pub name: String,
}

/// An interaction class and its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionClass {
    pub handle: InteractionClassHandle,
    pub name: String,
    pub order: OrderType,
    pub parameters: Vec<ParameterDefinition>,
}

impl InteractionClass {
    /// Look up a parameter handle by name.
    pub fn parameter_handle(&self, name: &str) -> Option<ParameterHandle> {
        self.parameters.iter().find(|p| p.name == name).map(|p| p.handle)
    }
}

/// Read-only catalog of the object and interaction classes of a federation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Fdd {
    object_classes: Vec<ObjectClass>,
    interaction_classes: Vec<InteractionClass>,
}

impl Fdd {
    /// Start building a catalog.
    pub fn builder() -> FddBuilder {
        FddBuilder::default()
    }

    /// Parse a catalog from its TOML form.
    pub fn from_toml_str(source: &str) -> Result<Fdd, FddError> {
        let document: FddDocument =
            toml::from_str(source).map_err(|e| FddError::Parse(e.to_string()))?;

        let mut builder = FddBuilder::default();
        for class in &document.object_classes {
            let attributes: Vec<(&str, OrderType)> = class
                .attributes
                .iter()
                .map(|a| (a.name.as_str(), a.order))
                .collect();
            builder = builder.object_class(&class.name, &attributes);
        }
        for class in &document.interaction_classes {
            let parameters: Vec<&str> = class.parameters.iter().map(String::as_str).collect();
            builder = builder.interaction_class(&class.name, class.order, &parameters);
        }
        let fdd = builder.build()?;
        tracing::debug!(
            object_classes = fdd.object_classes().len(),
            interaction_classes = fdd.interaction_classes().len(),
            "FDD loaded"
        );
        Ok(fdd)
    }

    pub fn object_classes(&self) -> &[ObjectClass] {
        &self.object_classes
    }

    pub fn interaction_classes(&self) -> &[InteractionClass] {
        &self.interaction_classes
    }

    pub fn object_class(&self, handle: ObjectClassHandle) -> Result<&ObjectClass, FddError> {
        self.object_classes
            .iter()
            .find(|c| c.handle == handle)
            .ok_or(FddError::ObjectClassNotDefined(handle))
    }

    pub fn object_class_handle(&self, name: &str) -> Result<ObjectClassHandle, FddError> {
        self.object_classes
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.handle)
            .ok_or_else(|| FddError::NameNotFound(name.to_string()))
    }

    pub fn attribute_handle(
        &self,
        class: ObjectClassHandle,
        name: &str,
    ) -> Result<AttributeHandle, FddError> {
        self.object_class(class)?
            .attribute_handle(name)
            .ok_or_else(|| FddError::NameNotFound(name.to_string()))
    }

    /// Fails with the first attribute of `attributes` not defined in `class`.
    pub fn check_attributes<'a>(
        &self,
        class: ObjectClassHandle,
        attributes: impl IntoIterator<Item = &'a AttributeHandle>,
    ) -> Result<(), FddError> {
        let object_class = self.object_class(class)?;
        for attribute in attributes {
            if object_class.attribute(*attribute).is_none() {
                return Err(FddError::AttributeNotDefined {
                    class,
                    attribute: *attribute,
                });
            }
        }
        Ok(())
    }

    /// Delivery order of an attribute.
    pub fn attribute_order(
        &self,
        class: ObjectClassHandle,
        attribute: AttributeHandle,
    ) -> Result<OrderType, FddError> {
        self.object_class(class)?
            .attribute(attribute)
            .map(|a| a.order)
            .ok_or(FddError::AttributeNotDefined { class, attribute })
    }

    pub fn interaction_class(
        &self,
        handle: InteractionClassHandle,
    ) -> Result<&InteractionClass, FddError> {
        self.interaction_classes
            .iter()
            .find(|c| c.handle == handle)
            .ok_or(FddError::InteractionClassNotDefined(handle))
    }

    pub fn interaction_class_handle(&self, name: &str) -> Result<InteractionClassHandle, FddError> {
        self.interaction_classes
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.handle)
            .ok_or_else(|| FddError::NameNotFound(name.to_string()))
    }

    pub fn parameter_handle(
        &self,
        class: InteractionClassHandle,
        name: &str,
    ) -> Result<ParameterHandle, FddError> {
        self.interaction_class(class)?
            .parameter_handle(name)
            .ok_or_else(|| FddError::NameNotFound(name.to_string()))
    }

    /// Fails with the first parameter of `parameters` not defined in `class`.
    pub fn check_parameters<'a>(
        &self,
        class: InteractionClassHandle,
        parameters: impl IntoIterator<Item = &'a ParameterHandle>,
    ) -> Result<(), FddError> {
        let interaction_class = self.interaction_class(class)?;
        for parameter in parameters {
            if !interaction_class.parameters.iter().any(|p| p.handle == *parameter) {
                return Err(FddError::InteractionParameterNotDefined {
                    class,
                    parameter: *parameter,
                });
            }
        }
        Ok(())
    }
}

/// Incremental [`Fdd`] construction. Handles are assigned in declaration order
/// starting at `1`; user attributes start at `2`.
#[derive(Debug, Default)]
pub struct FddBuilder {
    fdd: Fdd,
    error: Option<FddError>,
}

impl FddBuilder {
    /// Add an object class with the given attributes.
    pub fn object_class(mut self, name: &str, attributes: &[(&str, OrderType)]) -> Self {
        if self.error.is_some() {
            return self;
        }
        if self.fdd.object_classes.iter().any(|c| c.name == name) {
            self.error = Some(FddError::DuplicateName(name.to_string()));
            return self;
        }

        let mut seen = HashSet::new();
        seen.insert(PRIVILEGE_TO_DELETE_OBJECT);
        let mut definitions = vec![AttributeDefinition {
            handle: PRIVILEGE_TO_DELETE,
            name: PRIVILEGE_TO_DELETE_OBJECT.to_string(),
            order: OrderType::Receive,
        }];
        for (name, order) in attributes {
            if !seen.insert(*name) {
                self.error = Some(FddError::DuplicateName(name.to_string()));
                return self;
            }
            definitions.push(AttributeDefinition {
                handle: AttributeHandle(definitions.len() as u32 + 1),
                name: name.to_string(),
                order: *order,
            });
        }

        let handle = ObjectClassHandle(self.fdd.object_classes.len() as u32 + 1);
        self.fdd.object_classes.push(ObjectClass {
            handle,
            name: name.to_string(),
            attributes: definitions,
        });
        self
    }

    /// Add an interaction class with the given parameters.
    pub fn interaction_class(mut self, name: &str, order: OrderType, parameters: &[&str]) -> Self {
        if self.error.is_some() {
            return self;
        }
        if self.fdd.interaction_classes.iter().any(|c| c.name == name) {
            self.error = Some(FddError::DuplicateName(name.to_string()));
            return self;
        }

        let mut seen = HashSet::new();
        let mut definitions = Vec::with_capacity(parameters.len());
        for name in parameters {
            if !seen.insert(*name) {
                self.error = Some(FddError::DuplicateName(name.to_string()));
                return self;
            }
            definitions.push(ParameterDefinition {
                handle: ParameterHandle(definitions.len() as u32 + 1),
                name: name.to_string(),
            });
        }

        let handle = InteractionClassHandle(self.fdd.interaction_classes.len() as u32 + 1);
        self.fdd.interaction_classes.push(InteractionClass {
            handle,
            name: name.to_string(),
            order,
            parameters: definitions,
        });
        self
    }

    /// Finish the catalog, reporting the first construction error.
    pub fn build(self) -> Result<Fdd, FddError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.fdd),
        }
    }
}

#[derive(Deserialize)]
struct FddDocument {
    #[serde(default)]
    object_classes: Vec<ObjectClassDocument>,
    #[serde(default)]
    interaction_classes: Vec<InteractionClassDocument>,
}

#[derive(Deserialize)]
struct ObjectClassDocument {
    name: String,
    #[serde(default)]
    attributes: Vec<AttributeDocument>,
}

#[derive(Deserialize)]
struct AttributeDocument {
    name: String,
    #[serde(default)]
    order: OrderType,
}

#[derive(Deserialize)]
struct InteractionClassDocument {
    name: String,
    #[serde(default)]
    order: OrderType,
    #[serde(default)]
    parameters: Vec<String>,
}
