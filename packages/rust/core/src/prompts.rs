//! Prompt text for the verification pass.

use serde_json::Value;

use granthub_gateway::Prompt;
use granthub_shared::FAILED_TO_VERIFY;

const CLAIM_SYSTEM: &str = "You check facts about public funding programmes. \
Reply with strict JSON only, using the keys is_accurate, explanation and evidence.";

const FINAL_SYSTEM: &str = "You check facts about public funding programmes. \
Reply with either one JSON object in the requested shape or the exact text: failed to verify";

/// Ask whether one claim is supported by one source page.
pub(crate) fn claim_prompt(claim: &str, source_url: &str) -> Prompt {
    Prompt::user(format!(
        "Check the claim below against the page at {source_url}. Use only what that page says.\n\n\
         Claim:\n{claim}\n\n\
         Reply with a JSON object:\n\
         {{ \"is_accurate\": true | false | \"unknown\", \"explanation\": \"short reason\", \"evidence\": [\"quoted text\"] }}\n\
         No Markdown, no commentary."
    ))
    .with_system(CLAIM_SYSTEM)
}

/// Ask for the final record given the draft and the per-field verdicts.
pub(crate) fn final_prompt(draft: &Value, verdicts: &Value) -> Prompt {
    Prompt::user(format!(
        "Draft grant record:\n{draft}\n\n\
         Verdicts for each field of the draft:\n{verdicts}\n\n\
         - When every verdict has is_accurate true, return the draft unchanged.\n\
         - Otherwise return a corrected record with exactly the same keys: grantName, period, \
           grantDescription and applicationProcess (steps and requiredDocuments), every field \
           with its sourceUrl.\n\
         - When you are not confident in the corrected record, return only the text {FAILED_TO_VERIFY}.\n\
         No Markdown, no commentary."
    ))
    .with_system(FINAL_SYSTEM)
}
