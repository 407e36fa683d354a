//! Turn a recognition outcome into an authorization decision.
use doorbell_common::recognition::RecognitionOutcome;
use doorbell_common::results::{UNCLASSIFIED_NAME, UNKNOWN_NAME};
use doorbell_common::visitors::VisitorStore;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub recognized: bool,
    pub name: String,
    pub authorized: bool,
    /// The authorized visitor the decision was made for, if any.
    pub visitor_id: Option<i64>,
}

impl Decision {
    fn unmatched(name: &str) -> Self {
        Decision {
            recognized: false,
            name: name.to_owned(),
            authorized: false,
            visitor_id: None,
        }
    }

    fn recognized(name: &str) -> Self {
        Decision {
            recognized: true,
            name: name.to_owned(),
            authorized: false,
            visitor_id: None,
        }
    }
}

/// Decide who is at the door.
///
/// Candidates are tried in the order the recognition service returned them and the first one
/// matching an authorized visitor wins; its visit is recorded and its stored name is used. If no
/// candidate matches, or the store cannot be reached, the first candidate is reported as
/// recognized but not authorized.
pub async fn authorize(outcome: &RecognitionOutcome, visitors: &dyn VisitorStore) -> Decision {
    if !outcome.succeeded || !outcome.authenticated {
        let name = if outcome.is_unclassified() {
            UNCLASSIFIED_NAME
        } else {
            UNKNOWN_NAME
        };
        return Decision::unmatched(name);
    }

    let Some(first_candidate) = outcome.candidate_names.first() else {
        warn!("recognition service authenticated without naming anyone");
        return Decision::unmatched(UNKNOWN_NAME);
    };

    for candidate in &outcome.candidate_names {
        match visitors.find_authorized_by_name(candidate).await {
            Ok(Some(visitor)) => {
                if let Err(error) = visitors.increment_visit(visitor.id).await {
                    warn!(
                        visitor_id = visitor.id,
                        "failed to record visit: {}", error
                    );
                    metrics::counter!("doorbell_visit_tracking_failures").increment(1);
                }

                info!(
                    visitor_id = visitor.id,
                    candidate = candidate.as_str(),
                    "matched authorized visitor {}",
                    visitor.name
                );
                return Decision {
                    recognized: true,
                    name: visitor.name,
                    authorized: true,
                    visitor_id: Some(visitor.id),
                };
            }
            Ok(None) => continue,
            Err(error) => {
                warn!("visitor lookup failed, reporting as not authorized: {}", error);
                metrics::counter!("doorbell_visitor_lookup_failures").increment(1);
                return Decision::recognized(first_candidate);
            }
        }
    }

    Decision::recognized(first_candidate)
}
