use crate::event::Truncation;

/// Bounds the size of text fields while an event is being built, remembering
/// every field it had to cut.
#[derive(Debug)]
pub struct TextLimiter {
    max_text_len: usize,
    max_stack_len: usize,
    truncated: Vec<Truncation>,
}

impl TextLimiter {
    pub fn new(max_text_len: usize, max_stack_len: usize) -> Self {
        Self {
            max_text_len,
            max_stack_len,
            truncated: Vec::new(),
        }
    }

    /// Limits a message-like field to `max_text_len` characters.
    pub fn text(&mut self, field: &str, value: &str) -> String {
        self.limit(field, value, self.max_text_len)
    }

    /// Limits a stack trace to `max_stack_len` characters.
    pub fn stack(&mut self, field: &str, value: &str) -> String {
        self.limit(field, value, self.max_stack_len)
    }

    fn limit(&mut self, field: &str, value: &str, max: usize) -> String {
        match value.char_indices().nth(max) {
            None => value.to_string(),
            Some((cut, _)) => {
                self.truncated.push(Truncation {
                    field: field.to_string(),
                    original_len: value.chars().count(),
                });
                value[..cut].to_string()
            }
        }
    }

    pub fn into_truncations(self) -> Vec<Truncation> {
        self.truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_values_pass_through() {
        let mut limiter = TextLimiter::new(5, 10);
        assert_eq!(limiter.text("message", "hello"), "hello");
        assert!(limiter.into_truncations().is_empty());
    }

    #[test]
    fn cuts_on_char_boundaries_and_records_length() {
        let mut limiter = TextLimiter::new(3, 10);
        assert_eq!(limiter.text("message", "héllo wörld"), "hél");
        assert_eq!(limiter.stack("stack", "0123456789abc"), "0123456789");

        let cuts = limiter.into_truncations();
        assert_eq!(
            cuts,
            vec![
                Truncation { field: "message".into(), original_len: 11 },
                Truncation { field: "stack".into(), original_len: 13 },
            ]
        );
    }
}
