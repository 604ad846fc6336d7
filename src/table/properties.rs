use crate::error::{Error, ErrorCode, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// System property ids live below 1000; user properties start at 1000.
pub const PROP_STAMP: u32 = 0;
pub const PROP_EVENT: u32 = 1;
pub const PROP_UUID: u32 = 2;
pub const PROP_SEGMENT: u32 = 3;
pub const PROP_SESSION: u32 = 4;
pub const FIRST_USER_PROP: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropType {
    Int,
    Double,
    Bool,
    Text,
}

impl PropType {
    pub fn parse(text: &str) -> Result<Self> {
        match text {
            "int" => Ok(PropType::Int),
            "double" => Ok(PropType::Double),
            "bool" => Ok(PropType::Bool),
            "text" => Ok(PropType::Text),
            other => Err(Error::new(
                crate::error::ErrorClass::Config,
                ErrorCode::GeneralConfigError,
                format!("bad property type '{other}'"),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Property {
    pub id: u32,
    pub name: String,
    pub ptype: PropType,
    #[serde(default)]
    pub is_set: bool,
    #[serde(default)]
    pub is_customer: bool,
    #[serde(default)]
    pub deleted: bool,
}

/// Table schema: system properties plus user-defined ones. Property names
/// must start with a letter and contain only `[a-z0-9_]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Properties {
    props: Vec<Property>,
    #[serde(skip)]
    by_name: HashMap<String, usize>,
    next_user_id: u32,
}

impl Default for Properties {
    fn default() -> Self {
        Self::new()
    }
}

impl Properties {
    pub fn new() -> Self {
        let mut schema = Self {
            props: Vec::new(),
            by_name: HashMap::new(),
            next_user_id: FIRST_USER_PROP,
        };
        for (id, name, ptype) in [
            (PROP_STAMP, "stamp", PropType::Int),
            (PROP_EVENT, "event", PropType::Text),
            (PROP_UUID, "id", PropType::Text),
            (PROP_SEGMENT, "segment", PropType::Text),
            (PROP_SESSION, "session", PropType::Int),
        ] {
            schema.push(Property {
                id,
                name: name.to_string(),
                ptype,
                is_set: false,
                is_customer: false,
                deleted: false,
            });
        }
        schema
    }

    fn push(&mut self, prop: Property) {
        self.by_name.insert(prop.name.clone(), self.props.len());
        self.props.push(prop);
    }

    /// Rebuild the name index after deserialization.
    pub fn reindex(&mut self) {
        self.by_name = self
            .props
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.clone(), i))
            .collect();
    }

    fn validate_name(name: &str) -> Result<()> {
        let mut chars = name.chars();
        let legal_first = chars.next().map(|c| c.is_ascii_lowercase()).unwrap_or(false);
        let legal_rest = name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !legal_first || !legal_rest {
            return Err(Error::new(
                crate::error::ErrorClass::Config,
                ErrorCode::GeneralConfigError,
                format!("illegal property name '{name}'"),
            ));
        }
        Ok(())
    }

    pub fn add(
        &mut self,
        name: &str,
        ptype: PropType,
        is_set: bool,
        is_customer: bool,
    ) -> Result<&Property> {
        Self::validate_name(name)?;
        if let Some(&existing) = self.by_name.get(name) {
            // re-adding a soft-deleted property revives it
            if self.props[existing].deleted {
                self.props[existing].deleted = false;
                self.props[existing].ptype = ptype;
                self.props[existing].is_set = is_set;
                self.props[existing].is_customer = is_customer;
                return Ok(&self.props[existing]);
            }
            return Err(Error::new(
                crate::error::ErrorClass::Config,
                ErrorCode::GeneralConfigError,
                format!("property '{name}' already exists"),
            ));
        }

        let id = self.next_user_id;
        self.next_user_id += 1;
        self.push(Property {
            id,
            name: name.to_string(),
            ptype,
            is_set,
            is_customer,
            deleted: false,
        });
        Ok(self.props.last().unwrap())
    }

    /// Soft delete: the id and its attribute cells stay, the name stops
    /// resolving for new queries.
    pub fn soft_delete(&mut self, name: &str) -> Result<()> {
        match self.by_name.get(name) {
            Some(&index) if self.props[index].id >= FIRST_USER_PROP => {
                self.props[index].deleted = true;
                Ok(())
            }
            Some(_) => Err(Error::config("system properties cannot be dropped")),
            None => Err(Error::query(
                ErrorCode::PropertyNotInTable,
                format!("no property '{name}'"),
            )),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Property> {
        self.by_name
            .get(name)
            .map(|&i| &self.props[i])
            .filter(|p| !p.deleted)
    }

    pub fn get_by_id(&self, id: u32) -> Option<&Property> {
        self.props.iter().find(|p| p.id == id)
    }

    pub fn require(&self, name: &str) -> Result<&Property> {
        self.get(name).ok_or_else(|| {
            Error::query(
                ErrorCode::PropertyNotInTable,
                format!("no property '{name}' in table"),
            )
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Property> {
        self.props.iter().filter(|p| !p.deleted)
    }

    pub fn user_props(&self) -> impl Iterator<Item = &Property> {
        self.iter().filter(|p| p.id >= FIRST_USER_PROP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_props_seeded() {
        let schema = Properties::new();
        assert_eq!(schema.get("stamp").unwrap().id, PROP_STAMP);
        assert_eq!(schema.get("session").unwrap().id, PROP_SESSION);
    }

    #[test]
    fn test_user_ids_start_at_1000() {
        let mut schema = Properties::new();
        let id = schema.add("price", PropType::Double, false, false).unwrap().id;
        assert_eq!(id, FIRST_USER_PROP);
        let id2 = schema.add("product", PropType::Text, true, false).unwrap().id;
        assert_eq!(id2, FIRST_USER_PROP + 1);
    }

    #[test]
    fn test_illegal_names_rejected() {
        let mut schema = Properties::new();
        assert!(schema.add("9lives", PropType::Int, false, false).is_err());
        assert!(schema.add("Has-Caps", PropType::Int, false, false).is_err());
    }

    #[test]
    fn test_soft_delete_hides_and_revive_restores() {
        let mut schema = Properties::new();
        schema.add("plan", PropType::Text, false, false).unwrap();
        schema.soft_delete("plan").unwrap();
        assert!(schema.get("plan").is_none());

        let revived = schema.add("plan", PropType::Text, false, true).unwrap();
        assert_eq!(revived.id, FIRST_USER_PROP); // same id as before
        assert!(revived.is_customer);
    }
}
