//! Pure, total translation of CRM stage vocabularies onto [`LeadStatus`].

use leadpipe_core::LeadStatus;

/// Exact, case-insensitive lookup over HubSpot's lifecycle vocabulary.
/// Unknown or missing input lands on `New`.
pub fn map_lifecycle_stage(stage: Option<&str>) -> LeadStatus {
    let Some(stage) = stage else {
        return LeadStatus::New;
    };
    match stage.to_ascii_lowercase().as_str() {
        "subscriber" | "lead" => LeadStatus::New,
        "marketingqualifiedlead" => LeadStatus::Contacted,
        "salesqualifiedlead" => LeadStatus::Meeting,
        "opportunity" => LeadStatus::Negotiating,
        "customer" | "evangelist" => LeadStatus::ClosedWon,
        "other" => LeadStatus::Contacted,
        _ => LeadStatus::New,
    }
}

/// Substring match against the lower-cased deal stage, in fixed priority
/// order. Stage names are free text per pipeline, so several substrings
/// can match at once; the first check wins.
pub fn map_deal_stage(stage: Option<&str>) -> LeadStatus {
    let Some(stage) = stage else {
        return LeadStatus::New;
    };
    let stage = stage.to_ascii_lowercase();

    if stage.contains("won") {
        LeadStatus::ClosedWon
    } else if stage.contains("lost") {
        LeadStatus::ClosedLost
    } else if stage.contains("contract") || stage.contains("negotiation") {
        LeadStatus::Negotiating
    } else if stage.contains("meeting") || stage.contains("qualified") {
        LeadStatus::Meeting
    } else if stage.contains("contact") {
        LeadStatus::Contacted
    } else {
        LeadStatus::New
    }
}
