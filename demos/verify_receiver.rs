use webhook_delivery::{compute_signature, verify_webhook_request, SIGNATURE_HEADER, TIMESTAMP_HEADER};

fn main() {
    let secret = b"supersecret";
    let payload = br#"{"delivery_id":"...","event_id":"evt_123","payload":{"id":123}}"#;
    let timestamp = 1_700_000_000;
    let signature = compute_signature(secret, payload, timestamp);
    let timestamp = timestamp.to_string();

    let headers = [
        (SIGNATURE_HEADER, signature.as_str()),
        (TIMESTAMP_HEADER, timestamp.as_str()),
    ];

    match verify_webhook_request(headers, payload, secret, 300, 1_700_000_200) {
        Ok(()) => println!("signature ok"),
        Err(err) => println!("rejected: {err}"),
    }
}
