//! SCRAM-SHA-256 client conversation (RFC 5802, RFC 7677).
//!
//! Only the client side is implemented, and only what the upstream servers
//! require: no channel binding (`c=biws`) and no SASLprep beyond identity,
//! which is exact for ASCII credentials.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::error::{Result, WireError};

type HmacSha256 = Hmac<Sha256>;

const GS2_HEADER: &str = "n,,";
// base64 of the GS2 header above
const CHANNEL_BINDING: &str = "c=biws";
const MIN_ITERATIONS: u32 = 4096;

/// One SCRAM conversation: `client_first` -> `client_final` ->
/// `verify_server_final`, in that order.
pub struct ScramClient {
    username: String,
    password: String,
    nonce: String,
    client_first_bare: String,
    server_signature: Option<Vec<u8>>,
}

impl ScramClient {
    pub fn new(username: &str, password: &str) -> Self {
        let mut raw = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut raw);
        Self::with_nonce(username, password, &BASE64.encode(raw))
    }

    /// Fixed-nonce constructor, for tests against published vectors.
    pub fn with_nonce(username: &str, password: &str, nonce: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            nonce: nonce.to_string(),
            client_first_bare: String::new(),
            server_signature: None,
        }
    }

    /// The `client-first-message`, GS2 header included.
    pub fn client_first(&mut self) -> Vec<u8> {
        let bare = format!("n={},r={}", escape_username(&self.username), self.nonce);
        self.client_first_bare = bare.clone();
        format!("{GS2_HEADER}{bare}").into_bytes()
    }

    /// Consumes the `server-first-message` and produces the
    /// `client-final-message` carrying the proof.
    pub fn client_final(&mut self, server_first: &[u8]) -> Result<Vec<u8>> {
        let server_first = std::str::from_utf8(server_first)
            .map_err(|_| WireError::Auth("server-first message is not UTF-8".into()))?;
        let fields = parse_fields(server_first);

        let server_nonce = field(&fields, "r")?;
        if !server_nonce.starts_with(&self.nonce) {
            return Err(WireError::Auth(
                "server nonce does not extend the client nonce".into(),
            ));
        }
        let salt = BASE64
            .decode(field(&fields, "s")?)
            .map_err(|e| WireError::Auth(format!("bad salt: {e}")))?;
        let iterations: u32 = field(&fields, "i")?
            .parse()
            .map_err(|e| WireError::Auth(format!("bad iteration count: {e}")))?;
        if iterations < MIN_ITERATIONS {
            return Err(WireError::Auth(format!(
                "iteration count {iterations} below minimum {MIN_ITERATIONS}"
            )));
        }

        let mut salted_password = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            self.password.as_bytes(),
            &salt,
            iterations,
            &mut salted_password,
        );
        let client_key = hmac(&salted_password, b"Client Key");
        let stored_key = Sha256::digest(&client_key);

        let without_proof = format!("{CHANNEL_BINDING},r={server_nonce}");
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, without_proof
        );
        let client_signature = hmac(&stored_key, auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(key, sig)| key ^ sig)
            .collect();

        let server_key = hmac(&salted_password, b"Server Key");
        self.server_signature = Some(hmac(&server_key, auth_message.as_bytes()));

        Ok(format!("{without_proof},p={}", BASE64.encode(&proof)).into_bytes())
    }

    /// Checks the `v=` server signature in the `server-final-message`.
    pub fn verify_server_final(&self, server_final: &[u8]) -> Result<()> {
        let server_final = std::str::from_utf8(server_final)
            .map_err(|_| WireError::Auth("server-final message is not UTF-8".into()))?;
        let fields = parse_fields(server_final);
        let signature = BASE64
            .decode(field(&fields, "v")?)
            .map_err(|e| WireError::Auth(format!("bad server signature: {e}")))?;
        match &self.server_signature {
            Some(expected) if *expected == signature => Ok(()),
            _ => Err(WireError::Auth("server signature mismatch".into())),
        }
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

// '=' and ',' are the only characters SCRAM requires escaping in usernames.
fn escape_username(username: &str) -> String {
    let mut escaped = String::with_capacity(username.len());
    for c in username.chars() {
        match c {
            '=' => escaped.push_str("=3D"),
            ',' => escaped.push_str("=2C"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn parse_fields(message: &str) -> HashMap<&str, &str> {
    message
        .split(',')
        .filter_map(|part| part.split_once('='))
        .collect()
}

fn field<'a>(fields: &HashMap<&str, &'a str>, name: &str) -> Result<&'a str> {
    fields
        .get(name)
        .copied()
        .ok_or_else(|| WireError::Auth(format!("missing '{name}' field")))
}
