/// Sources longer than this are cut before they are sent.
const MAX_SOURCE_CHARS: usize = 48_000;

pub fn system_prompt() -> String {
    "You are a senior software engineer documenting an existing code base. \
For each source file you are given, describe what it does so that files can later be \
grouped into product domains and traced to requirements.\n\n\
Focus on:\n\
- The primary purpose of the file in one or two sentences\n\
- Key functionality, one short phrase per item\n\
- Dependencies on other modules, libraries and hardware interfaces\n\
- Interfaces the file exposes to the rest of the system\n\
- Implementation details a maintainer must know\n\
- Potential issues or technical debt, only when concrete\n\
- A short lowercase domain label such as \"ui\", \"motor\" or \"ui/display\"; \
use \"/\" to name a subdomain\n\
- Every function or method with its line number\n\n\
Output ONLY a JSON object of the form \
{\"purpose\":\"...\",\"keyFunctionality\":[\"...\"],\"dependencies\":[\"...\"],\
\"interfaces\":[\"...\"],\"implementationDetails\":[\"...\"],\"potentialIssues\":[\"...\"],\
\"domain\":\"...\",\"functions\":[{\"name\":\"...\",\"line\":1,\"parameters\":[\"...\"],\
\"returnType\":\"...\",\"description\":\"...\"}]}. \
Use null for a domain you cannot determine. Output nothing else."
        .to_string()
}

/// Wrap `content` in a fenced block, truncating at a char boundary.
pub fn user_message(content: &str, language: &str) -> String {
    let (body, truncated) = match content.char_indices().nth(MAX_SOURCE_CHARS) {
        Some((cut, _)) => (&content[..cut], true),
        None => (content, false),
    };

    let mut out = String::with_capacity(body.len() + 128);
    out.push_str("Analyze this ");
    out.push_str(language);
    out.push_str(" source file.\n\n```");
    out.push_str(language);
    out.push('\n');
    out.push_str(body);
    if !body.ends_with('\n') {
        out.push('\n');
    }
    out.push_str("```");
    if truncated {
        out.push_str("\n(The file was truncated.)");
    }
    out
}
