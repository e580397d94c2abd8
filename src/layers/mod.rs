//! Built-in layers. Each is a thin stage over one repository; the linguistic
//! quality of the output is whatever the data files make it.

pub mod dictionary;
pub mod phrase_lookup;
pub mod pre_processing;
pub mod rules;

use std::sync::Arc;

use crate::layer::Layer;
use crate::repository::Repositories;

pub use dictionary::DictionaryLayer;
pub use phrase_lookup::PhraseLookupLayer;
pub use pre_processing::PreProcessingLayer;
pub use rules::RuleLayer;

/// One layer per `LayerType`, wired to the given repositories.
pub fn default_layers(repos: &Repositories) -> Vec<Arc<dyn Layer>> {
    vec![
        Arc::new(PreProcessingLayer::new()),
        Arc::new(PhraseLookupLayer::new(repos.phrases.clone())),
        Arc::new(DictionaryLayer::new(repos.dictionary.clone())),
        Arc::new(RuleLayer::new(repos.grammar.clone())),
        Arc::new(RuleLayer::new(repos.word_order.clone())),
        Arc::new(RuleLayer::new(repos.post_processing.clone())),
    ]
}

/// Split leading and trailing non-alphanumeric characters off a token:
/// `"(Hello!"` → `("(", "Hello", "!")`.
pub(crate) fn split_affixes(token: &str) -> (&str, &str, &str) {
    let start = token
        .char_indices()
        .find(|(_, c)| c.is_alphanumeric())
        .map(|(i, _)| i)
        .unwrap_or(token.len());
    let end = token
        .char_indices()
        .rev()
        .find(|(_, c)| c.is_alphanumeric())
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(start);
    let end = end.max(start);
    (&token[..start], &token[start..end], &token[end..])
}

/// Capitalise `target` if `source` starts with an uppercase letter.
pub(crate) fn match_case(source: &str, target: &str) -> String {
    let source_upper = source.chars().next().is_some_and(char::is_uppercase);
    if !source_upper {
        return target.to_string();
    }
    let mut chars = target.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
