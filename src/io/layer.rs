use crate::types::{Crs, ProfileError, ProfileResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Integer,
    Real,
    Text,
}

/// Attribute column of a vector layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    /// Mandatory fields may not be removed from the schema
    pub mandatory: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            mandatory: false,
        }
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl AttributeValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttributeValue::Integer(v) => Some(*v),
            AttributeValue::Real(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Integer(v) => Some(*v as f64),
            AttributeValue::Real(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(s) => Some(s),
            _ => None,
        }
    }

    fn matches(&self, field_type: FieldType) -> bool {
        matches!(
            (self, field_type),
            (AttributeValue::Null, _)
                | (AttributeValue::Integer(_), FieldType::Integer)
                | (AttributeValue::Integer(_), FieldType::Real)
                | (AttributeValue::Real(_), FieldType::Real)
                | (AttributeValue::Text(_), FieldType::Text)
        )
    }
}

/// A point feature with attributes
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub fid: i64,
    pub x: f64,
    pub y: f64,
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl Feature {
    pub fn attribute(&self, name: &str) -> &AttributeValue {
        self.attributes.get(name).unwrap_or(&AttributeValue::Null)
    }
}

/// Persistent store of point features.
pub trait VectorLayer {
    fn crs(&self) -> Crs;

    fn fields(&self) -> Vec<FieldDef>;

    fn add_field(&mut self, field: FieldDef) -> ProfileResult<()>;

    /// Remove a non-mandatory field and its values
    fn remove_field(&mut self, name: &str) -> ProfileResult<()>;

    /// Append a feature; returns its feature id.
    fn add_feature(&mut self, x: f64, y: f64, attributes: BTreeMap<String, AttributeValue>) -> ProfileResult<i64>;

    /// Delete features; returns how many existed.
    fn delete_features(&mut self, fids: &[i64]) -> usize;

    fn update_attribute(&mut self, fid: i64, name: &str, value: AttributeValue) -> ProfileResult<()>;

    fn feature(&self, fid: i64) -> Option<Feature>;

    fn features(&self) -> Vec<Feature>;

    fn has_field(&self, name: &str) -> bool {
        self.fields().iter().any(|f| f.name == name)
    }
}

/// Vector layer kept in memory
#[derive(Debug, Clone)]
pub struct MemoryLayer {
    crs: Crs,
    fields: Vec<FieldDef>,
    features: BTreeMap<i64, Feature>,
    next_fid: i64,
}

impl MemoryLayer {
    pub fn new(crs: Crs) -> Self {
        Self {
            crs,
            fields: Vec::new(),
            features: BTreeMap::new(),
            next_fid: 1,
        }
    }

    fn field_def(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }
}

impl VectorLayer for MemoryLayer {
    fn crs(&self) -> Crs {
        self.crs.clone()
    }

    fn fields(&self) -> Vec<FieldDef> {
        self.fields.clone()
    }

    fn add_field(&mut self, field: FieldDef) -> ProfileResult<()> {
        if field.name.trim().is_empty() {
            return Err(ProfileError::InvalidInput("field name must not be empty".to_string()));
        }
        if self.field_def(&field.name).is_some() {
            return Err(ProfileError::InvalidInput(format!("field '{}' already exists", field.name)));
        }
        self.fields.push(field);
        Ok(())
    }

    fn remove_field(&mut self, name: &str) -> ProfileResult<()> {
        match self.field_def(name) {
            None => Err(ProfileError::InvalidInput(format!("no field '{}'", name))),
            Some(f) if f.mandatory => Err(ProfileError::InvalidInput(format!(
                "field '{}' is mandatory",
                name
            ))),
            Some(_) => {
                self.fields.retain(|f| f.name != name);
                for feature in self.features.values_mut() {
                    feature.attributes.remove(name);
                }
                Ok(())
            }
        }
    }

    fn add_feature(&mut self, x: f64, y: f64, attributes: BTreeMap<String, AttributeValue>) -> ProfileResult<i64> {
        for (name, value) in &attributes {
            let field = self
                .field_def(name)
                .ok_or_else(|| ProfileError::InvalidInput(format!("no field '{}'", name)))?;
            if !value.matches(field.field_type) {
                return Err(ProfileError::InvalidInput(format!(
                    "value {:?} does not fit field '{}' ({:?})",
                    value, name, field.field_type
                )));
            }
        }
        let fid = self.next_fid;
        self.next_fid += 1;
        self.features.insert(fid, Feature { fid, x, y, attributes });
        Ok(fid)
    }

    fn delete_features(&mut self, fids: &[i64]) -> usize {
        fids.iter().filter(|fid| self.features.remove(fid).is_some()).count()
    }

    fn update_attribute(&mut self, fid: i64, name: &str, value: AttributeValue) -> ProfileResult<()> {
        let field_type = self
            .field_def(name)
            .map(|f| f.field_type)
            .ok_or_else(|| ProfileError::InvalidInput(format!("no field '{}'", name)))?;
        if !value.matches(field_type) {
            return Err(ProfileError::InvalidInput(format!(
                "value {:?} does not fit field '{}'",
                value, name
            )));
        }
        let feature = self
            .features
            .get_mut(&fid)
            .ok_or_else(|| ProfileError::InvalidInput(format!("no feature {}", fid)))?;
        feature.attributes.insert(name.to_string(), value);
        Ok(())
    }

    fn feature(&self, fid: i64) -> Option<Feature> {
        self.features.get(&fid).cloned()
    }

    fn features(&self) -> Vec<Feature> {
        self.features.values().cloned().collect()
    }
}
