use base64::{engine::general_purpose::STANDARD, Engine as _};

/// Encode credentials as an HTTP Basic proxy-auth header value.
/// Returns `"Basic <base64(username:password)>"` with standard padding.
pub fn basic_header(username: &str, password: &str) -> String {
    let credentials = format!("{}:{}", username, password);
    format!("Basic {}", STANDARD.encode(credentials.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_value() {
        // RFC 7617 example: Aladdin:open sesame -> QWxhZGRpbjpvcGVuIHNlc2FtZQ==
        assert_eq!(
            basic_header("Aladdin", "open sesame"),
            "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="
        );
    }

    #[test]
    fn test_wire_value() {
        assert_eq!(basic_header("alice", "secret"), "Basic YWxpY2U6c2VjcmV0");
    }

    #[test]
    fn test_empty_password_keeps_colon() {
        assert_eq!(basic_header("alice", ""), format!("Basic {}", STANDARD.encode("alice:")));
    }
}
