#[cfg(test)]
mod tests_impl {
    use crate::core::condition::{Condition, Endpoint};
    use crate::core::constants::layers;
    use crate::core::filter::{Action, Filter, MatchType};
    use crate::core::templates;
    use crate::core::test_helpers::{installed_scope, memory_manager, outbound};
    use crate::engine::memory::ConditionValue;
    use std::net::Ipv4Addr;

    #[test]
    fn test_every_condition_slot_written_once() {
        let (engine, mut manager) = memory_manager();
        let scope = installed_scope(&mut manager, layers::ALE_AUTH_CONNECT_V4);
        let filter = templates::block_dns(&scope, Some(Ipv4Addr::new(9, 9, 9, 9)), false)
            .with_condition(Condition::port(Endpoint::Local, MatchType::Greater, 1024))
            .with_condition(Condition::app_id(MatchType::Equal, r"C:\apps\client.exe"));

        let id = manager.add_filter(&filter).unwrap();
        let installed = engine.filters();
        let stored = installed.iter().find(|f| f.id == id.get()).unwrap();

        assert_eq!(stored.conditions.len(), filter.conditions.len());
        for (slot, condition) in stored.conditions.iter().zip(&filter.conditions) {
            assert_eq!(slot.field, condition.field());
            assert_eq!(slot.match_type, condition.match_type());
            assert_ne!(slot.value, ConditionValue::Unset);
        }
        assert_eq!(engine.live_builders(), 0);
    }

    #[test]
    fn test_dns_exception_under_block() {
        let (engine, mut manager) = memory_manager();
        let scope = installed_scope(&mut manager, layers::ALE_AUTH_CONNECT_V4);
        let resolver = Ipv4Addr::new(9, 9, 9, 9);

        manager
            .add_filter(&templates::block_dns(&scope, Some(resolver), false))
            .unwrap();
        manager
            .add_filter(&templates::allow_remote_ip(
                &scope,
                resolver,
                Ipv4Addr::BROADCAST,
                false,
            ))
            .unwrap();
        manager
            .add_filter(&templates::allow_remote_ip(
                &scope,
                Ipv4Addr::new(8, 8, 8, 8),
                Ipv4Addr::BROADCAST,
                false,
            ))
            .unwrap();
        manager
            .add_filter(&templates::block_all(&scope, false, false))
            .unwrap();

        let layer = layers::ALE_AUTH_CONNECT_V4;
        assert_eq!(engine.classify(&layer, &outbound("9.9.9.9:53")), Action::Permit);
        // Block DNS (weight 4) outranks allow-remote-ip (weight 3)
        assert_eq!(engine.classify(&layer, &outbound("8.8.8.8:53")), Action::Block);
        assert_eq!(engine.classify(&layer, &outbound("8.8.8.8:443")), Action::Permit);
        assert_eq!(engine.classify(&layer, &outbound("1.1.1.1:443")), Action::Block);
    }

    #[test]
    fn test_application_allowed_through_block_all() {
        let (engine, mut manager) = memory_manager();
        let scope = installed_scope(&mut manager, layers::ALE_AUTH_CONNECT_V4);
        manager
            .add_filter(&templates::allow_application(&scope, r"C:\vpn\client.exe", false))
            .unwrap();
        manager
            .add_filter(&templates::block_all(&scope, false, false))
            .unwrap();

        let layer = layers::ALE_AUTH_CONNECT_V4;
        let conn = outbound("203.0.113.7:1194");
        assert_eq!(engine.classify(&layer, &conn), Action::Block);
        assert_eq!(
            engine.classify(&layer, &conn.clone().by_app(r"c:\VPN\client.exe")),
            Action::Permit
        );
    }

    #[test]
    fn test_ipv6_block_all_leaves_ipv4_alone() {
        let (engine, mut manager) = memory_manager();
        let scope = installed_scope(&mut manager, layers::ALE_AUTH_CONNECT_V6);
        manager
            .add_filter(&templates::block_all(&scope, true, false))
            .unwrap();
        manager
            .add_filter(&templates::allow_remote_ipv6(
                &scope,
                "2001:db8::".parse().unwrap(),
                32,
                false,
            ))
            .unwrap();

        let v6 = layers::ALE_AUTH_CONNECT_V6;
        assert_eq!(engine.classify(&v6, &outbound("[2001:db8::1]:443")), Action::Permit);
        assert_eq!(engine.classify(&v6, &outbound("[2001:db9::1]:443")), Action::Block);
        assert_eq!(
            engine.classify(&layers::ALE_AUTH_CONNECT_V4, &outbound("1.1.1.1:443")),
            Action::Permit
        );
    }

    #[test]
    fn test_filter_without_conditions_matches_everything() {
        let (engine, mut manager) = memory_manager();
        let scope = installed_scope(&mut manager, layers::ALE_AUTH_RECV_ACCEPT_V4);
        let filter = Filter::new(
            scope.provider,
            scope.layer,
            scope.sublayer,
            "drop inbound",
            "",
        );
        manager.add_filter(&filter).unwrap();
        assert_eq!(
            engine.classify(&layers::ALE_AUTH_RECV_ACCEPT_V4, &outbound("10.1.1.1:22")),
            Action::Block
        );
    }
}

#[cfg(test)]
mod property_tests {
    use crate::core::condition::{Condition, Endpoint};
    use crate::core::constants::layers;
    use crate::core::filter::{Action, Filter, MatchType};
    use crate::core::identity::Identity;
    use crate::core::test_helpers::{installed_scope, memory_manager, outbound, test_provider};
    use ipnetwork::Ipv4Network;
    use proptest::prelude::*;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};

    fn arb_match_type() -> impl Strategy<Value = MatchType> {
        prop_oneof![
            Just(MatchType::Equal),
            Just(MatchType::NotEqual),
            Just(MatchType::Greater),
            Just(MatchType::Less),
            Just(MatchType::GreaterOrEqual),
            Just(MatchType::LessOrEqual),
        ]
    }

    fn arb_endpoint() -> impl Strategy<Value = Endpoint> {
        prop_oneof![Just(Endpoint::Local), Just(Endpoint::Remote)]
    }

    fn arb_condition() -> impl Strategy<Value = Condition> {
        prop_oneof![
            (arb_endpoint(), arb_match_type(), any::<u16>())
                .prop_map(|(e, m, port)| Condition::port(e, m, port)),
            (arb_endpoint(), any::<u32>(), 0u8..=32).prop_map(|(e, ip, prefix)| {
                let net = Ipv4Network::new(Ipv4Addr::from(ip), prefix).unwrap();
                Condition::v4(e, MatchType::Equal, net.ip(), net.mask())
            }),
            (arb_endpoint(), any::<u128>(), 0u8..=128).prop_map(|(e, ip, prefix)| {
                Condition::v6(e, MatchType::Equal, Ipv6Addr::from(ip), prefix)
            }),
            "[a-zA-Z0-9:\\\\. ]{1,40}"
                .prop_map(|path| Condition::app_id(MatchType::Equal, path)),
        ]
    }

    proptest! {
        #[test]
        fn test_installed_slots_match_conditions(
            conditions in proptest::collection::vec(arb_condition(), 0..6)
        ) {
            let (engine, mut manager) = memory_manager();
            let scope = installed_scope(&mut manager, layers::ALE_AUTH_CONNECT_V4);
            let mut filter = Filter::new(scope.provider, scope.layer, scope.sublayer, "prop", "");
            filter.conditions = conditions.clone();

            let id = manager.add_filter(&filter).unwrap();
            prop_assert!(id.get() != 0);
            let installed = engine.filters();
            let stored = installed.iter().find(|f| f.id == id.get()).unwrap();
            prop_assert_eq!(stored.conditions.len(), conditions.len());
            for (slot, condition) in stored.conditions.iter().zip(&conditions) {
                prop_assert_eq!(slot.field, condition.field());
            }
            prop_assert_eq!(engine.live_builders(), 0);
        }

        #[test]
        fn test_v4_block_matches_network_membership(
            net_ip in any::<u32>(),
            prefix in 0u8..=32,
            target in any::<u32>(),
            port in 1u16..=65535
        ) {
            let (engine, mut manager) = memory_manager();
            let scope = installed_scope(&mut manager, layers::ALE_AUTH_CONNECT_V4);
            let net = Ipv4Network::new(Ipv4Addr::from(net_ip), prefix).unwrap();
            let filter = Filter::new(scope.provider, scope.layer, scope.sublayer, "block net", "")
                .with_condition(Condition::v4(
                    Endpoint::Remote,
                    MatchType::Equal,
                    net.ip(),
                    net.mask(),
                ));
            manager.add_filter(&filter).unwrap();

            let remote = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(target), port));
            let conn = outbound(&remote.to_string());
            let verdict = engine.classify(&layers::ALE_AUTH_CONNECT_V4, &conn);
            let expected = if net.contains(Ipv4Addr::from(target)) {
                Action::Block
            } else {
                Action::Permit
            };
            prop_assert_eq!(verdict, expected);
        }

        #[test]
        fn test_provider_info_reflects_persistence(persistent in any::<bool>()) {
            let (_engine, mut manager) = memory_manager();
            let provider = test_provider(persistent);
            manager.add_provider(&provider).unwrap();
            let info = manager.get_provider_info(&provider.key).unwrap();
            prop_assert!(info.is_installed);
            prop_assert_eq!(info.is_persistent, persistent);
        }

        #[test]
        fn test_unknown_provider_is_never_an_error(raw in any::<u128>()) {
            let (_engine, mut manager) = memory_manager();
            let info = manager.get_provider_info(&Identity::from_u128(raw)).unwrap();
            prop_assert!(!info.is_installed);
            prop_assert!(!info.is_persistent);
        }
    }
}
