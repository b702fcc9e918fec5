//! Terminal stand-ins for the interactive dialogs

use async_trait::async_trait;
use quick_hn_lib::ingest::{AttributeKind, AttributeSelector};
use quick_hn_lib::{AttributeMapping, Confirmation, ConfirmationRequest, Confirmer};
use std::io::{BufRead, Write};

/// Minutes a "remember" answer keeps a pair of street names confirmed
const REMEMBER_MINUTES: i64 = 10;

/// Parse an answer to the fallback question
fn parse_answer(answer: &str) -> Confirmation {
    match answer.trim().to_lowercase().as_str() {
        "y" | "yes" => Confirmation::accept(),
        "r" | "remember" => Confirmation::accept_for_minutes(REMEMBER_MINUTES),
        _ => Confirmation::Cancel,
    }
}

/// Asks on stdin whether to attach to the nearest segment of another street
pub struct StdinConfirmer;

#[async_trait]
impl Confirmer for StdinConfirmer {
    async fn confirm(&self, request: &ConfirmationRequest) -> Confirmation {
        let question = format!(
            "Street name \"{}\" could not be found. The nearest segment {} is on \"{}\".\n\
             Add house number {} to it? [y]es / [r]emember for {REMEMBER_MINUTES} minutes / [N]o: ",
            request.feature_street, request.segment, request.segment_street, request.number
        );

        let answer = tokio::task::spawn_blocking(move || {
            let mut stderr = std::io::stderr();
            let _ = stderr.write_all(question.as_bytes());
            let _ = stderr.flush();
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line).map(|_| line)
        })
        .await;

        match answer {
            Ok(Ok(line)) => parse_answer(&line),
            Ok(Err(error)) => {
                tracing::warn!(%error, "Could not read the answer, cancelling");
                Confirmation::Cancel
            }
            Err(error) => {
                tracing::warn!(%error, "Prompt task failed, cancelling");
                Confirmation::Cancel
            }
        }
    }
}

/// Accepts every fallback without asking
pub struct AcceptAll;

#[async_trait]
impl Confirmer for AcceptAll {
    async fn confirm(&self, request: &ConfirmationRequest) -> Confirmation {
        tracing::info!(
            feature_street = %request.feature_street,
            segment_street = %request.segment_street,
            number = %request.number,
            "Accepting nearest segment of another street"
        );
        Confirmation::accept()
    }
}

/// Uses the mapping given on the command line, or guesses one from well-known keys
pub struct CliAttributeSelector {
    mapping: Option<AttributeMapping>,
}

impl CliAttributeSelector {
    pub fn new(mapping: Option<AttributeMapping>) -> Self {
        Self { mapping }
    }
}

#[async_trait]
impl AttributeSelector for CliAttributeSelector {
    async fn select(
        &self,
        available: &[String],
        _kinds: &[AttributeKind],
    ) -> Option<AttributeMapping> {
        if let Some(mapping) = &self.mapping {
            return Some(mapping.clone());
        }
        let guessed = AttributeMapping::guess(available);
        match &guessed {
            Some(mapping) => tracing::info!(
                number = %mapping.number,
                street = ?mapping.street,
                "Guessed attribute mapping"
            ),
            None => tracing::error!(
                available = %available.join(", "),
                "No house number attribute recognized, pass --number"
            ),
        }
        guessed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_answer() {
        assert_eq!(parse_answer("y\n"), Confirmation::accept());
        assert_eq!(parse_answer(" YES "), Confirmation::accept());
        assert_eq!(
            parse_answer("r"),
            Confirmation::accept_for_minutes(REMEMBER_MINUTES)
        );
        assert_eq!(parse_answer(""), Confirmation::Cancel);
        assert_eq!(parse_answer("no"), Confirmation::Cancel);
    }

    #[tokio::test]
    async fn test_selector_prefers_explicit_mapping() {
        let available = vec!["addr:housenumber".to_string(), "hn".to_string()];
        let explicit = CliAttributeSelector::new(Some(AttributeMapping::new("hn")));
        assert_eq!(
            explicit.select(&available, &[]).await.unwrap().number,
            "hn"
        );

        let guessing = CliAttributeSelector::new(None);
        assert_eq!(
            guessing.select(&available, &[]).await.unwrap().number,
            "addr:housenumber"
        );
        assert!(guessing.select(&["name".to_string()], &[]).await.is_none());
    }
}
