use super::QName;

/// An attribute set on an element, with a name and value:
/// `prefix:name="value"`
///
/// Attributes are owned by exactly one element and are not part of the child chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    name: QName,
    value: String,
}
impl Attribute {
    /// Create a new attribute.
    pub fn new(name: impl Into<QName>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Returns the name of the attribute.
    #[must_use]
    pub fn name(&self) -> &QName {
        &self.name
    }

    /// Returns the value of the attribute.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }
}

/// Insertion-ordered attributes keyed by (namespace, local name).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct AttributeMap(Vec<Attribute>);
impl AttributeMap {
    pub fn get(&self, namespace: Option<&str>, local: &str) -> Option<&Attribute> {
        self.0.iter().find(|a| a.name.equals(namespace, local))
    }

    /// Replaces the value of an existing attribute in place, keeping its position.
    pub fn set(&mut self, attribute: Attribute) -> Option<String> {
        let existing = self
            .0
            .iter_mut()
            .find(|a| a.name == attribute.name);

        match existing {
            Some(a) => {
                let old = std::mem::replace(&mut a.value, attribute.value);
                a.name = attribute.name;
                Some(old)
            }
            None => {
                self.0.push(attribute);
                None
            }
        }
    }

    pub fn remove(&mut self, namespace: Option<&str>, local: &str) -> Option<Attribute> {
        let index = self.0.iter().position(|a| a.name.equals(namespace, local))?;
        Some(self.0.remove(index))
    }

    pub fn as_slice(&self) -> &[Attribute] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_keeps_insertion_order() {
        let mut map = AttributeMap::default();
        map.set(Attribute::new("id", "1"));
        map.set(Attribute::new("class", "a"));
        assert_eq!(map.set(Attribute::new("id", "2")), Some("1".to_string()));

        let names: Vec<String> = map.as_slice().iter().map(|a| a.name().to_string()).collect();
        assert_eq!(names, ["id", "class"]);
        assert_eq!(map.get(None, "id").map(Attribute::value), Some("2"));
    }

    #[test]
    fn test_namespaced_lookup() {
        let mut map = AttributeMap::default();
        map.set(Attribute::new(QName::new(Some("urn:x"), Some("x"), "id"), "ns"));
        map.set(Attribute::new("id", "plain"));

        assert_eq!(map.get(Some("urn:x"), "id").map(Attribute::value), Some("ns"));
        assert_eq!(map.get(None, "id").map(Attribute::value), Some("plain"));
        assert!(map.remove(Some("urn:x"), "id").is_some());
        assert!(map.get(Some("urn:x"), "id").is_none());
    }
}
