//! Input clean-up: typographic quotes and dashes to ASCII, control characters
//! dropped, whitespace runs collapsed.

use crate::error::LayerError;
use crate::layer::{Layer, LayerDebugInfo, LayerOutput, LayerType, TranslationContext};

pub struct PreProcessingLayer;

impl PreProcessingLayer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PreProcessingLayer {
    fn default() -> Self {
        Self::new()
    }
}

fn substitute(c: char) -> Option<char> {
    match c {
        '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{00AB}' | '\u{00BB}' => Some('"'),
        '\u{2018}' | '\u{2019}' | '\u{201A}' => Some('\''),
        '\u{2013}' | '\u{2014}' => Some('-'),
        '\u{00A0}' | '\u{2009}' | '\u{202F}' => Some(' '),
        _ => None,
    }
}

impl Layer for PreProcessingLayer {
    fn name(&self) -> &str {
        "pre_processing"
    }

    fn description(&self) -> &str {
        "typographic quote and whitespace normalization"
    }

    fn layer_type(&self) -> LayerType {
        LayerType::PreProcessing
    }

    fn can_handle(&self, text: &str, _context: &TranslationContext) -> bool {
        !text.trim().is_empty()
    }

    fn process(&self, text: &str, _context: &TranslationContext) -> Result<LayerOutput, LayerError> {
        let mut modifications = 0usize;
        let mut cleaned = String::with_capacity(text.len());
        for c in text.chars() {
            if let Some(replacement) = substitute(c) {
                cleaned.push(replacement);
                modifications += 1;
            } else if c.is_control() && !c.is_whitespace() {
                modifications += 1;
            } else {
                cleaned.push(c);
            }
        }

        let tokens: Vec<&str> = cleaned.split_whitespace().collect();
        let collapsed = tokens.join(" ");
        if collapsed.len() != cleaned.len() {
            modifications += 1;
        }

        Ok(LayerOutput::new(
            collapsed,
            LayerDebugInfo {
                items_processed: tokens.len(),
                modifications,
                ..Default::default()
            },
        ))
    }
}
