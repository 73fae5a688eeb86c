use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Strip `//` line comments, keeping line breaks and everything before the marker.
pub fn remove_comments(query: &str) -> String {
    query
        .split('\n')
        .map(|line| match line.find("//") {
            Some(pos) => &line[..pos],
            None => line,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Canonical form used for identity: no comments, no whitespace, lower case.
pub fn normalize(query: &str) -> String {
    remove_comments(query)
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Stable statement id: base-64 SHA-256 of the normalized text.
///
/// Comment placement, spacing and case never change the id.
pub fn statement_id(query: &str) -> String {
    let digest = Sha256::digest(normalize(query).as_bytes());
    BASE64.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_comments() {
        let query = "// Well this comment\n  MATCH (n:Node) // also this one\n  SET n.NoComments = true";
        let expected = "\n  MATCH (n:Node) \n  SET n.NoComments = true";
        assert_eq!(remove_comments(query), expected);
    }

    #[test]
    fn test_remove_comments_without_comments() {
        assert_eq!(remove_comments("RETURN 1"), "RETURN 1");
    }

    #[test]
    fn test_same_id_regardless_of_whitespace_comments_case() {
        let queries = [
            "// this comment\n    MATCH (n:Node) RETURN n",
            "MATCH(n:Node)RETURNn",
            "// comment\n// comment\n// comment\n    MATch (n:node) return n",
            "match\t(n:NODE)\r\n  return n // trailing",
        ];
        let ids: Vec<String> = queries.iter().map(|q| statement_id(q)).collect();
        assert!(ids.iter().all(|id| id == &ids[0]));
    }

    #[test]
    fn test_different_queries_have_different_ids() {
        assert_ne!(
            statement_id("MATCH (n:Person) RETURN n"),
            statement_id("MATCH (n:Movie) RETURN n")
        );
    }

    #[test]
    fn test_id_is_base64_sha256() {
        let id = statement_id("RETURN 1");
        // 32 bytes of digest -> 44 base-64 characters with padding
        assert_eq!(id.len(), 44);
        assert!(id.ends_with('='));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(
            normalize("// note\nMATCH (n:Person) WHERE n.age > 30 RETURN n"),
            "match(n:person)wheren.age>30returnn"
        );
    }
}
