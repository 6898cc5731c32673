//! Character-fold tokenizer.
//!
//! Alphanumerics map to `codepoint % vocab_size`, spaces to 0, everything
//! else is dropped. Good enough for the encoder's bag-of-characters view;
//! tokenizer quality is explicitly out of scope.

/// Tokenize `text` into at most `max_length` ids. Never returns an empty
/// vector: blank input folds to `[0]`.
pub fn tokenize(text: &str, vocab_size: usize, max_length: usize) -> Vec<u32> {
    let vocab = vocab_size.max(1) as u32;
    let mut tokens = Vec::new();
    for ch in text.to_lowercase().chars() {
        if tokens.len() >= max_length {
            break;
        }
        if ch.is_alphanumeric() {
            tokens.push(ch as u32 % vocab);
        } else if ch == ' ' {
            tokens.push(0);
        }
    }
    if tokens.is_empty() {
        tokens.push(0);
    }
    tokens
}

/// Approximate inverse of [`tokenize`], for diagnostics only.
pub fn detokenize(token_ids: &[u32]) -> String {
    token_ids
        .iter()
        .map(|&tid| {
            if tid == 0 {
                ' '
            } else if tid < 128 {
                char::from_u32(tid).unwrap_or(' ')
            } else {
                char::from_u32('a' as u32 + tid % 26).unwrap_or(' ')
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alphanumerics_fold_into_vocab() {
        let tokens = tokenize("Hello World 42", 32000, 512);
        assert_eq!(tokens.len(), 14);
        assert_eq!(tokens[5], 0); // space
        assert!(tokens.iter().all(|&t| t < 32000));
    }

    #[test]
    fn punctuation_is_dropped() {
        let a = tokenize("a,b.c!", 1000, 512);
        let b = tokenize("abc", 1000, 512);
        assert_eq!(a, b);
    }

    #[test]
    fn empty_input_folds_to_zero() {
        assert_eq!(tokenize("", 1000, 512), vec![0]);
        assert_eq!(tokenize("!!!", 1000, 512), vec![0]);
    }

    #[test]
    fn output_is_truncated() {
        let tokens = tokenize(&"x".repeat(1000), 1000, 16);
        assert_eq!(tokens.len(), 16);
    }

    #[test]
    fn case_is_folded() {
        assert_eq!(tokenize("ABC", 1000, 16), tokenize("abc", 1000, 16));
    }

    #[test]
    fn detokenize_restores_ascii() {
        let tokens = tokenize("abc def", 32000, 512);
        assert_eq!(detokenize(&tokens), "abc def");
    }
}
