//! Prompt text for the two discovery phases.

use granthub_gateway::Prompt;

const LIST_SYSTEM: &str = "You research public funding programmes. \
Answer with a JSON array of strings and nothing else.";

const DETAIL_SYSTEM: &str = "You research public funding programmes. \
Answer with one JSON object in the requested shape and nothing else.";

/// Ask for up to `cap` distinct, currently relevant programme names.
pub(crate) fn list_prompt(topic: &str, cap: usize) -> Prompt {
    Prompt::user(format!(
        "List up to {cap} {topic} that are open now or closed within the last six months.\n\
         Use each programme's exact official name and do not repeat a programme.\n\
         Reply with a JSON array of names only, for example [\"Name One\", \"Name Two\"]."
    ))
    .with_system(LIST_SYSTEM)
}

/// Ask for the full record of one named programme.
pub(crate) fn detail_prompt(topic: &str, name: &str) -> Prompt {
    Prompt::user(format!(
        "Research the programme \"{name}\" ({topic}) and describe it in exactly this JSON shape:\n\
         {{\n\
           \"grantName\": {{ \"value\": \"official name\", \"sourceUrl\": \"official page\" }},\n\
           \"period\": {{ \"range\": \"application window or 'Ongoing'\", \"sourceUrl\": \"page stating it\" }},\n\
           \"grantDescription\": {{ \"text\": \"purpose, eligibility, funding amount, beneficiaries\", \"sourceUrl\": \"page stating it\" }},\n\
           \"applicationProcess\": {{\n\
             \"steps\": {{ \"description\": \"how to apply, step by step\", \"sourceUrl\": \"page stating it\" }},\n\
             \"requiredDocuments\": {{\n\
               \"sourceUrl\": \"page listing the documents\",\n\
               \"files\": [ {{ \"name\": \"document\", \"downloadUrl\": \"template link or null\", \"sourceUrl\": \"page mentioning it\" }} ]\n\
             }}\n\
           }}\n\
         }}\n\
         Every sourceUrl must be a real page you relied on. Use null for downloadUrl when there is no direct link."
    ))
    .with_system(DETAIL_SYSTEM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_prompt_mentions_cap_and_topic() {
        let prompt = list_prompt("test grants", 7);
        assert!(prompt.user.contains("up to 7 test grants"));
        assert!(prompt.system.is_some());
    }

    #[test]
    fn detail_prompt_names_every_field() {
        let prompt = detail_prompt("test grants", "Digital Grant X");
        for key in ["grantName", "period", "grantDescription", "requiredDocuments", "downloadUrl"] {
            assert!(prompt.user.contains(key), "missing {key}");
        }
        assert!(prompt.user.contains("\"Digital Grant X\""));
    }
}
