use proptest::prelude::*;

use relay_protocol::{ChatPolicy, Command, InboundFrame, OutgoingEnvelope, participants_key};

// --- Pair keys ---

proptest! {
    #[test]
    fn participants_key_symmetric(a in any::<u64>(), b in any::<u64>()) {
        prop_assert_eq!(participants_key(a, b), participants_key(b, a));
    }

    #[test]
    fn participants_key_lists_lower_id_first(a in any::<u64>(), b in any::<u64>()) {
        let key = participants_key(a, b);
        let (low, high) = key.split_once('&').unwrap();
        prop_assert_eq!(low.parse::<u64>().unwrap(), a.min(b));
        prop_assert_eq!(high.parse::<u64>().unwrap(), a.max(b));
    }

    #[test]
    fn distinct_pairs_get_distinct_keys(a in 0u64..1000, b in 0u64..1000, c in 0u64..1000, d in 0u64..1000) {
        let same_pair = (a.min(b), a.max(b)) == (c.min(d), c.max(d));
        prop_assert_eq!(participants_key(a, b) == participants_key(c, d), same_pair);
    }
}

// --- Policy ---

fn arb_category() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("visitor".to_string()),
        Just("exhibitor".to_string()),
        Just("organizer".to_string()),
    ]
}

proptest! {
    #[test]
    fn pair_check_is_symmetric(a in arb_category(), b in arb_category()) {
        let policy = ChatPolicy::default();
        prop_assert_eq!(policy.check_pair(&a, &b).is_ok(), policy.check_pair(&b, &a).is_ok());
        prop_assert_eq!(policy.check_pair(&a, &b).is_ok(), a != b);
    }
}

// --- Frames ---

proptest! {
    #[test]
    fn parse_never_panics(text in ".{0,200}") {
        let _ = InboundFrame::parse(&text);
    }

    #[test]
    fn send_frames_keep_their_text(window in "[a-f0-9-]{1,36}", message in ".{0,100}") {
        let raw = serde_json::json!({
            "action": "send",
            "chatWindowId": window,
            "message": message,
        })
        .to_string();
        let command = InboundFrame::parse(&raw).unwrap().into_command().unwrap();
        prop_assert_eq!(command, Command::Send { chat_window_id: window, message });
    }

    #[test]
    fn only_bus_copies_carry_a_target(from in any::<u64>(), target in "[a-z0-9-]{1,36}") {
        let env = OutgoingEnvelope::new_message("w", from, "x");
        prop_assert!(!env.to_json().unwrap().contains("toConnection"));

        let decoded = OutgoingEnvelope::decode(&env.addressed_to(&target).to_json().unwrap()).unwrap();
        prop_assert_eq!(decoded.to_connection, Some(target));
        prop_assert_eq!(decoded.from, from);
    }
}
