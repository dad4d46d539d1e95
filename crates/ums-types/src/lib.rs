//! Validated primitive text types shared across the UMS crates.

/// Errors that can occur when creating validated text types.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TextError {
    /// The input text was empty or contained only whitespace
    #[error("Text cannot be empty")]
    Empty,

    /// The input text was shorter than the required minimum
    #[error("Text must be at least {min} characters (got {actual})")]
    TooShort { min: usize, actual: usize },
}

/// A string type that guarantees non-empty content.
///
/// This type wraps a `String` and ensures it contains at least one non-whitespace character.
/// The input is automatically trimmed of leading and trailing whitespace during construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NonEmptyText(String);

impl NonEmptyText {
    /// Creates a new `NonEmptyText` from the given input.
    ///
    /// The input is trimmed of leading and trailing whitespace. If the trimmed
    /// result is empty, an error is returned.
    ///
    /// # Arguments
    ///
    /// * `input` - Any type that can be converted to a string reference
    ///
    /// # Returns
    ///
    /// Returns `Ok(NonEmptyText)` if the trimmed input is non-empty,
    /// or `Err(TextError::Empty)` if it's empty or contains only whitespace.
    pub fn new(input: impl AsRef<str>) -> Result<Self, TextError> {
        let trimmed = input.as_ref().trim();
        if trimmed.is_empty() {
            return Err(TextError::Empty);
        }
        Ok(Self(trimmed.to_owned()))
    }

    /// Creates a new `NonEmptyText` that must hold at least `min` characters once trimmed.
    ///
    /// Characters are counted as Unicode scalar values, not bytes, so accented clinical
    /// prose is not penalised.
    ///
    /// # Errors
    ///
    /// Returns `TextError::Empty` for blank input and `TextError::TooShort` when the trimmed
    /// text has fewer than `min` characters.
    pub fn with_min_chars(input: impl AsRef<str>, min: usize) -> Result<Self, TextError> {
        let text = Self::new(input)?;
        let actual = text.char_count();
        if actual < min {
            return Err(TextError::TooShort { min, actual });
        }
        Ok(text)
    }

    /// Returns the inner string as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of characters in the trimmed text.
    pub fn char_count(&self) -> usize {
        self.0.chars().count()
    }
}

impl std::fmt::Display for NonEmptyText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for NonEmptyText {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for NonEmptyText {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for NonEmptyText {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NonEmptyText::new(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_trims_input() {
        let text = NonEmptyText::new("  Office visit  ").unwrap();
        assert_eq!(text.as_str(), "Office visit");
    }

    #[test]
    fn test_new_rejects_whitespace_only() {
        assert_eq!(NonEmptyText::new("   \n\t").unwrap_err(), TextError::Empty);
    }

    #[test]
    fn test_with_min_chars_counts_characters_not_bytes() {
        let text = NonEmptyText::with_min_chars("résumé é", 8).unwrap();
        assert_eq!(text.char_count(), 8);
    }

    #[test]
    fn test_with_min_chars_rejects_short_text() {
        let err = NonEmptyText::with_min_chars("  fix  ", 10).unwrap_err();
        assert_eq!(err, TextError::TooShort { min: 10, actual: 3 });
    }

    #[test]
    fn test_deserialize_rejects_empty_string() {
        let result: Result<NonEmptyText, _> = serde_json::from_str("\"  \"");
        assert!(result.is_err());
    }
}
