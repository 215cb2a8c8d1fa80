use super::*;

// =============================================================================
// bytes_to_hex
// =============================================================================

#[test]
fn bytes_to_hex_empty() {
    assert_eq!(bytes_to_hex(&[]), "");
}

#[test]
fn bytes_to_hex_leading_zero() {
    assert_eq!(bytes_to_hex(&[0x0a]), "0a");
}

#[test]
fn bytes_to_hex_multi_byte() {
    assert_eq!(bytes_to_hex(&[0xde, 0xad, 0xbe, 0xef]), "deadbeef");
}

// =============================================================================
// token generation
// =============================================================================

#[test]
fn generate_token_is_64_hex_chars() {
    let token = generate_token();
    assert_eq!(token.len(), 64);
    assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn generate_ws_ticket_is_32_hex_chars() {
    let ticket = generate_ws_ticket();
    assert_eq!(ticket.len(), 32);
    assert!(ticket.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn two_tokens_differ() {
    assert_ne!(generate_token(), generate_token());
    assert_ne!(generate_ws_ticket(), generate_ws_ticket());
}

// =============================================================================
// SessionUser serialization
// =============================================================================

#[test]
fn session_user_serializes_role_lowercase() {
    let user = SessionUser {
        id: Uuid::new_v4(),
        name: "Asha".into(),
        avatar_url: None,
        role: Role::Mentor,
        region: Some("west".into()),
        college: None,
    };
    let json = serde_json::to_value(&user).unwrap();
    assert_eq!(json["role"], "mentor");
    assert_eq!(json["region"], "west");
    assert!(json["college"].is_null());
}
