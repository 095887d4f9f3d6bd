use serde::{Deserialize, Serialize};

/// A list field that may be absent, `null`, a single item or a sequence.
#[derive(Default, Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum NoneOrSome<T> {
    #[serde(skip_deserializing)]
    #[default]
    Unspecified,
    None,
    One(T),
    Some(Vec<T>),
}

impl<T> NoneOrSome<T> {
    pub fn len(&self) -> usize {
        match self {
            NoneOrSome::Unspecified => 0,
            NoneOrSome::None => 0,
            NoneOrSome::One(_) => 1,
            NoneOrSome::Some(v) => v.len(),
        }
    }

    pub fn into_vec(self) -> Vec<T> {
        match self {
            NoneOrSome::Unspecified | NoneOrSome::None => vec![],
            NoneOrSome::One(item) => vec![item],
            NoneOrSome::Some(v) => v,
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        match self {
            NoneOrSome::Unspecified | NoneOrSome::None => [].iter(),
            NoneOrSome::One(item) => std::slice::from_ref(item).iter(),
            NoneOrSome::Some(v) => v.iter(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A scalar or a non-empty sequence.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum OneOrSome<T> {
    One(T),
    #[serde(deserialize_with = "validate_non_empty")]
    Some(Vec<T>),
}

fn validate_non_empty<'de, D, T>(d: D) -> Result<Vec<T>, D::Error>
where
    D: serde::de::Deserializer<'de>,
    T: Deserialize<'de>,
{
    let value = Vec::deserialize(d)?;
    if value.is_empty() {
        return Err(serde::de::Error::invalid_value(
            serde::de::Unexpected::Other("empty"),
            &"need at least one element",
        ));
    }
    Ok(value)
}

impl<T> OneOrSome<T> {
    #[cfg(test)]
    pub fn len(&self) -> usize {
        match self {
            OneOrSome::One(_) => 1,
            OneOrSome::Some(v) => v.len(),
        }
    }

    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrSome::One(item) => vec![item],
            OneOrSome::Some(v) => v,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_or_some_forms() {
        let absent: NoneOrSome<String> = NoneOrSome::default();
        assert!(absent.is_empty());
        let null: NoneOrSome<String> = serde_yaml::from_str("~").unwrap();
        assert!(matches!(null, NoneOrSome::None));
        let one: NoneOrSome<String> = serde_yaml::from_str("a").unwrap();
        assert_eq!(one.iter().collect::<Vec<_>>(), vec!["a"]);
        let some: NoneOrSome<String> = serde_yaml::from_str("[a, b]").unwrap();
        assert_eq!(some.into_vec(), vec!["a", "b"]);
    }

    #[test]
    fn test_one_or_some_rejects_empty() {
        assert!(serde_yaml::from_str::<OneOrSome<u16>>("[]").is_err());
        assert_eq!(serde_yaml::from_str::<OneOrSome<u16>>("5").unwrap().into_vec(), vec![5]);
    }
}
