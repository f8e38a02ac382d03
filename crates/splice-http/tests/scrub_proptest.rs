use proptest::prelude::*;

use splice_http::{scrub_fields, BodyFraming, Fields, HOP_BY_HOP_FIELDS};

fn field_name() -> impl Strategy<Value = String> {
    prop_oneof![
        "[A-Za-z][A-Za-z0-9-]{0,12}",
        Just("Connection".to_string()),
        Just("Transfer-Encoding".to_string()),
        Just("Content-Length".to_string()),
        Just("Proxy-Connection".to_string()),
        Just("X-Custom".to_string()),
    ]
}

fn field_value() -> impl Strategy<Value = String> {
    prop_oneof![
        "[A-Za-z0-9 ,=-]{0,20}",
        Just("close".to_string()),
        Just("keep-alive".to_string()),
        Just("X-Custom, close".to_string()),
        Just("chunked".to_string()),
    ]
}

fn arbitrary_fields() -> impl Strategy<Value = Fields> {
    prop::collection::vec((field_name(), field_value()), 0..12)
        .prop_map(|pairs| pairs.into_iter().collect())
}

fn arbitrary_framing() -> impl Strategy<Value = BodyFraming> {
    prop_oneof![
        Just(BodyFraming::None),
        (0u64..1_000_000).prop_map(BodyFraming::ContentLength),
        Just(BodyFraming::Chunked),
        Just(BodyFraming::Unbounded),
    ]
}

proptest! {
    #[test]
    fn scrub_is_idempotent(fields in arbitrary_fields(), framing in arbitrary_framing()) {
        let mut once = fields;
        scrub_fields(&mut once, framing);
        let mut twice = once.clone();
        scrub_fields(&mut twice, framing);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn scrub_removes_hop_by_hop_and_named_fields(
        fields in arbitrary_fields(),
        framing in arbitrary_framing(),
    ) {
        let connection_tokens = fields.split_tokens("Connection");
        let mut scrubbed = fields;
        scrub_fields(&mut scrubbed, framing);

        // The single framing field the scrubber appended is the only
        // blacklist name allowed to survive.
        let appended = match framing.known_size() {
            Some(_) => "Content-Length",
            None => "Transfer-Encoding",
        };
        for field in scrubbed.iter() {
            let blacklisted = HOP_BY_HOP_FIELDS
                .iter()
                .any(|blocked| field.name.eq_ignore_ascii_case(blocked));
            if blacklisted {
                prop_assert!(field.name.eq_ignore_ascii_case(appended));
            }
            for token in &connection_tokens {
                if !token.eq_ignore_ascii_case(appended) {
                    prop_assert!(!field.name.eq_ignore_ascii_case(token));
                }
            }
        }
    }

    #[test]
    fn scrub_advertises_exactly_one_framing_field(
        fields in arbitrary_fields(),
        framing in arbitrary_framing(),
    ) {
        let mut scrubbed = fields;
        scrub_fields(&mut scrubbed, framing);

        let content_lengths: Vec<_> = scrubbed
            .iter()
            .filter(|field| field.name.eq_ignore_ascii_case("content-length"))
            .collect();
        let transfer_encodings: Vec<_> = scrubbed
            .iter()
            .filter(|field| field.name.eq_ignore_ascii_case("transfer-encoding"))
            .collect();

        match framing.known_size() {
            Some(size) => {
                prop_assert_eq!(content_lengths.len(), 1);
                prop_assert_eq!(&content_lengths[0].value, &size.to_string());
                prop_assert!(transfer_encodings.is_empty());
            }
            None => {
                prop_assert_eq!(transfer_encodings.len(), 1);
                prop_assert_eq!(&transfer_encodings[0].value, "chunked");
                prop_assert!(content_lengths.is_empty());
            }
        }
    }
}
