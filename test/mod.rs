// Copyright (c) 2015-2016 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.


macro_rules! treemap {
    ($($k:expr => $v:expr),*) => {
        {
            let mut m = BTreeMap::new();
            $(m.insert($k, $v);)*
            m
        }
    };
}

fn list_items(value: &crate::Value) -> Vec<crate::Value> {
    match *value {
        crate::Value::List(ref l) => l.borrow().clone(),
        ref other => panic!("not a list: {:?}", other),
    }
}

mod value_tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::iter::FromIterator;
    use num_bigint::BigInt;
    use rand::{RngCore, thread_rng};
    use quickcheck::{QuickCheck, StdGen};
    use crate::{value_from_slice, value_to_vec, DeOptions, SerOptions, Serializer, Deserializer};
    use crate::{Global, Value, HashableValue};
    use crate::error::{Error, ErrorCode};
    use super::arby::Tree;
    use super::list_items;

    fn get_test_object() -> Value {
        let longish = BigInt::from(10000000000u64) * BigInt::from(10000000000u64);
        let set = BTreeSet::from_iter(vec![HashableValue::I64(42), HashableValue::I64(0)]);
        Value::dict(treemap!(
            HashableValue::None => Value::None,
            HashableValue::Bool(false) => Value::tuple(vec![Value::Bool(false),
                                                            Value::Bool(true)]),
            HashableValue::I64(10) => Value::I64(100000),
            HashableValue::I64(-256) => Value::I64(-0x1_0000_0000),
            HashableValue::Int(longish.clone()) => Value::Int(longish),
            HashableValue::F64(1.0) => Value::F64(1.0),
            HashableValue::Bytes(b"bytes".to_vec()) => Value::Bytes(b"bytes".to_vec()),
            HashableValue::Bytes(vec![]) => Value::Bytes(vec![0xff, 0, b'\n', b'\\']),
            HashableValue::String("string".into()) => Value::String("line\nbreak \\ \u{e9}\u{1f600}".into()),
            HashableValue::FrozenSet(set.clone()) => Value::frozenset(set.clone()),
            HashableValue::Global(Global::new("collections", "OrderedDict")) =>
                Value::global("collections", "OrderedDict"),
            HashableValue::Tuple(vec![HashableValue::I64(1), HashableValue::I64(2)]) =>
                Value::tuple(vec![Value::I64(1), Value::I64(2), Value::I64(3), Value::I64(4)]),
            HashableValue::Tuple(vec![]) =>
                Value::list(vec![
                    Value::list(vec![Value::I64(1), Value::I64(2), Value::I64(3)]),
                    Value::set(set),
                    Value::dict(BTreeMap::new()),
                    Value::tuple(vec![]),
                ])))
    }

    fn roundtrip(value: &Value, proto: u8) -> Value {
        let vec = value_to_vec(value, SerOptions::new().proto(proto)).unwrap();
        value_from_slice(&vec, DeOptions::new()).unwrap()
    }

    #[test]
    fn roundtrip_all_protocols() {
        let dict = get_test_object();
        for proto in 0..=5 {
            assert_eq!(roundtrip(&dict, proto), dict, "protocol {}", proto);
        }
    }

    #[test]
    fn simple_list_fixtures() {
        let list = Value::list(vec![Value::I64(1), Value::I64(2), Value::I64(3)]);
        let fixtures: &[(u8, &[u8])] = &[
            (0, b"(lp0\nI1\naI2\naI3\na."),
            (1, b"]q\x00(K\x01K\x02K\x03e."),
            (2, b"\x80\x02]q\x00(K\x01K\x02K\x03e."),
            (3, b"\x80\x03]q\x00(K\x01K\x02K\x03e."),
            (4, b"\x80\x04\x95\x0b\x00\x00\x00\x00\x00\x00\x00]\x94(K\x01K\x02K\x03e."),
            (5, b"\x80\x05\x95\x0b\x00\x00\x00\x00\x00\x00\x00]\x94(K\x01K\x02K\x03e."),
        ];
        for &(proto, bytes) in fixtures {
            assert_eq!(value_to_vec(&list, SerOptions::new().proto(proto)).unwrap(), bytes);
            assert_eq!(value_from_slice(bytes, DeOptions::new()).unwrap(), list);
        }
    }

    #[test]
    fn integer_encodings() {
        let enc = |v: i64, proto: u8| value_to_vec(&Value::I64(v), SerOptions::new().proto(proto)).unwrap();
        assert_eq!(enc(-256, 2), b"\x80\x02J\x00\xff\xff\xff.");
        assert_eq!(enc(-256, 3), b"\x80\x03J\x00\xff\xff\xff.");
        assert_eq!(enc(255, 2), b"\x80\x02K\xff.");
        assert_eq!(enc(256, 2), b"\x80\x02M\x00\x01.");
        assert_eq!(enc(1 << 40, 2), b"\x80\x02\x8a\x06\x00\x00\x00\x00\x00\x01.");
        assert_eq!(enc(-1 << 40, 2), b"\x80\x02\x8a\x06\x00\x00\x00\x00\x00\xff.");
        assert_eq!(enc(-256, 0), b"I-256\n.");
        assert_eq!(enc(1 << 40, 0), b"L1099511627776L\n.");
        assert_eq!(value_to_vec(&Value::Int(BigInt::from(0)), SerOptions::new().proto(2)).unwrap(),
                   b"\x80\x02K\x00.");
        assert_eq!(value_to_vec(&Value::Bool(true), SerOptions::new().proto(0)).unwrap(), b"I01\n.");
        assert_eq!(value_to_vec(&Value::Bool(true), SerOptions::new().proto(2)).unwrap(), b"\x80\x02\x88.");
        // LONG1 with a zero-length payload is zero.
        assert_eq!(value_from_slice(b"\x80\x02\x8a\x00.", DeOptions::new()).unwrap(), Value::I64(0));
    }

    #[test]
    fn string_and_bytes_encodings() {
        let s = Value::String("a\\b\u{e9}\u{263a}".into());
        assert_eq!(value_to_vec(&s, SerOptions::new().proto(0)).unwrap(),
                   b"Va\\u005cb\xe9\\u263a\n.".to_vec());
        assert_eq!(value_to_vec(&Value::String("hi".into()), SerOptions::new().proto(3)).unwrap(),
                   b"\x80\x03X\x02\x00\x00\x00hi.");
        assert_eq!(value_to_vec(&Value::Bytes(b"hi".to_vec()), SerOptions::new().proto(3)).unwrap(),
                   b"\x80\x03C\x02hi.");
        assert_eq!(value_to_vec(&Value::Bytes(vec![]), SerOptions::new().proto(2)).unwrap(),
                   b"\x80\x02c__builtin__\nbytes\nq\x00)R.".to_vec());
        assert_eq!(value_to_vec(&Value::Bytes(b"\xff".to_vec()), SerOptions::new().proto(2)).unwrap(),
                   b"\x80\x02c_codecs\nencode\nq\x00X\x02\x00\x00\x00\xc3\xbfX\x06\x00\x00\x00latin1\x86R.".to_vec());
        // A raw-unicode-escape backslash not starting an escape is literal.
        assert_eq!(value_from_slice(b"Va\\b\n.", DeOptions::new()).unwrap(),
                   Value::String("a\\b".into()));
    }

    #[test]
    fn python2_strings() {
        let stream = b"\x80\x02U\x03abcq\x00.";
        assert_eq!(value_from_slice(stream, DeOptions::new()).unwrap(), Value::Bytes(b"abc".to_vec()));
        assert_eq!(value_from_slice(stream, DeOptions::new().decode_strings()).unwrap(),
                   Value::String("abc".into()));
        assert_eq!(value_from_slice(b"S'a\\n\\x41'\np0\n.", DeOptions::new()).unwrap(),
                   Value::Bytes(b"a\nA".to_vec()));
    }

    #[test]
    fn sharing_is_preserved() {
        let shared = Value::list(vec![Value::I64(1)]);
        let outer = Value::list(vec![shared.clone(), shared.clone()]);
        assert_eq!(value_to_vec(&outer, SerOptions::new().proto(2)).unwrap(),
                   b"\x80\x02]q\x00(]q\x01K\x01ah\x01e.");
        for proto in 0..=5 {
            let items = list_items(&roundtrip(&outer, proto));
            assert!(items[0].is(&items[1]), "protocol {}", proto);
            assert!(!items[0].is(&shared));
        }
    }

    #[test]
    fn memo_indices_are_monotonic() {
        let outer = Value::list(vec![Value::list(vec![]), Value::list(vec![]), Value::list(vec![])]);
        assert_eq!(value_to_vec(&outer, SerOptions::new().proto(2)).unwrap(),
                   b"\x80\x02]q\x00(]q\x01]q\x02]q\x03e.");
        assert_eq!(value_to_vec(&outer, SerOptions::new().proto(0)).unwrap(),
                   b"(lp0\n(lp1\na(lp2\na(lp3\na.");
    }

    #[test]
    fn self_containing_list() {
        let list = Value::list(vec![]);
        if let Value::List(ref l) = list {
            l.borrow_mut().push(list.clone());
        }
        assert_eq!(value_to_vec(&list, SerOptions::new().proto(2)).unwrap(), b"\x80\x02]q\x00h\x00a.");
        for proto in 0..=5 {
            let tripped = roundtrip(&list, proto);
            assert!(list_items(&tripped)[0].is(&tripped), "protocol {}", proto);
        }
    }

    #[test]
    fn self_containing_dict() {
        let dict = Value::dict(BTreeMap::new());
        if let Value::Dict(ref d) = dict {
            d.borrow_mut().insert(HashableValue::String("me".into()), dict.clone());
        }
        let key = HashableValue::String("me".into());
        for proto in 0..=5 {
            let tripped = roundtrip(&dict, proto);
            match tripped {
                Value::Dict(ref d) => assert!(d.borrow()[&key].is(&tripped)),
                ref other => panic!("not a dict: {:?}", other),
            }
        }
    }

    #[test]
    fn recursive_tuple() {
        let list = Value::list(vec![]);
        let tuple = Value::tuple(vec![list.clone()]);
        if let Value::List(ref l) = list {
            l.borrow_mut().push(tuple.clone());
        }
        assert_eq!(value_to_vec(&tuple, SerOptions::new().proto(2)).unwrap(),
                   b"\x80\x02]q\x00h\x00\x85q\x01a0h\x01.");
        assert_eq!(value_to_vec(&tuple, SerOptions::new().proto(1)).unwrap(),
                   b"(]q\x00(h\x00tq\x01a1h\x01.");
        for proto in 0..=5 {
            let tripped = roundtrip(&tuple, proto);
            let inner = match tripped {
                Value::Tuple(ref t) => t[0].clone(),
                ref other => panic!("not a tuple: {:?}", other),
            };
            assert!(list_items(&inner)[0].is(&tripped), "protocol {}", proto);
        }
    }

    #[test]
    fn deep_nesting() {
        let mut value = Value::None;
        for _ in 0..100_000 {
            value = Value::list(vec![value]);
        }
        let vec = value_to_vec(&value, SerOptions::new()).unwrap();
        let tripped = value_from_slice(&vec, DeOptions::new()).unwrap();
        let mut depth = 0;
        let mut cur = tripped.clone();
        while let Some(next) = list_items(&cur).pop() {
            depth += 1;
            if let Value::None = next {
                break;
            }
            cur = next;
        }
        assert_eq!(depth, 100_000);
    }

    #[test]
    fn deep_stream_is_dropped_iteratively() {
        let mut stream = b"\x80\x02".to_vec();
        stream.extend(std::iter::repeat(b']').take(200_000));
        stream.extend(std::iter::repeat(b'a').take(199_999));
        // Truncated: the decoder's own stack holds the deep list.
        match value_from_slice(&stream, DeOptions::new()) {
            Err(Error::Eval(ErrorCode::EOFWhileParsing, pos)) => assert_eq!(pos, stream.len()),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        stream.push(b'.');
        let value = value_from_slice(&stream, DeOptions::new()).unwrap();
        assert_eq!(list_items(&value).len(), 1);
        drop(value);

        // The same through tuples, dicts and generic objects.
        let mut stream = b"\x80\x02N".to_vec();
        for _ in 0..100_000 {
            stream.extend(b"\x85q\x000}K\x01h\x00s");
        }
        stream.push(b'.');
        assert!(value_from_slice(&stream, DeOptions::new()).is_ok());
        let mut stream = b"\x80\x02N".to_vec();
        for _ in 0..100_000 {
            stream.extend(b"\x85q\x000cpkg\nThing\n)\x81h\x00b");
        }
        stream.push(b'.');
        let value = value_from_slice(&stream, DeOptions::new()).unwrap();
        assert_eq!(value.type_name(), "pkg.Thing");
    }

    #[test]
    fn hashable_nesting_is_bounded() {
        let mut key = Value::None;
        for _ in 0..crate::value::HASHABLE_DEPTH_LIMIT {
            key = Value::tuple(vec![key]);
        }
        assert!(key.clone().into_hashable().is_ok());
        let deeper = Value::tuple(vec![key]);
        match deeper.into_hashable() {
            Err(Error::Syntax(ErrorCode::NestingTooDeep(_))) => {}
            other => panic!("unexpected result: {:?}", other),
        }

        // 200000 nested tuples used as a dict key.
        let mut stream = b"\x80\x02}N".to_vec();
        stream.extend(std::iter::repeat(b'\x85').take(200_000));
        stream.extend(b"Ns.");
        match value_from_slice(&stream, DeOptions::new()) {
            Err(Error::Eval(ErrorCode::NestingTooDeep(_), _)) => {}
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }

        // Frozensets nested inside frozensets are counted as well.
        let mut stream = b"\x80\x04".to_vec();
        for _ in 0..1000 {
            stream.push(b'(');
        }
        stream.extend(b"(\x91");
        stream.extend(std::iter::repeat(b'\x91').take(1000));
        stream.push(b'.');
        match value_from_slice(&stream, DeOptions::new()) {
            Err(Error::Eval(ErrorCode::NestingTooDeep(_), _)) => {}
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn fast_mode() {
        let shared = Value::list(vec![Value::I64(1)]);
        let outer = Value::list(vec![shared.clone(), shared]);
        let vec = value_to_vec(&outer, SerOptions::new().proto(2).no_memo()).unwrap();
        assert_eq!(vec, b"\x80\x02](]K\x01a]K\x01ae.");
        let items = list_items(&value_from_slice(&vec, DeOptions::new()).unwrap());
        assert!(!items[0].is(&items[1]));
        assert_eq!(items[0], items[1]);

        let list = Value::list(vec![]);
        if let Value::List(ref l) = list {
            l.borrow_mut().push(list.clone());
        }
        match value_to_vec(&list, SerOptions::new().no_memo()) {
            Err(Error::Recursive(_)) => {}
            other => panic!("unexpected result {:?}", other),
        }
        if let Value::List(ref l) = list {
            l.borrow_mut().clear();
        }
    }

    #[test]
    fn repeated_dumps_share_the_memo() {
        let shared = Value::list(vec![Value::I64(7)]);
        let mut ser = Serializer::new(Vec::new(), SerOptions::new().proto(2)).unwrap();
        ser.dump(&shared).unwrap();
        ser.dump(&Value::list(vec![shared.clone()])).unwrap();
        let buf = ser.into_inner();
        assert_eq!(buf, b"\x80\x02]q\x00K\x07a.\x80\x02]q\x01h\x00a.");

        let mut de = Deserializer::new(&buf[..], DeOptions::new());
        let first = de.deserialize_value().unwrap();
        let second = de.deserialize_value().unwrap();
        de.end().unwrap();
        assert!(list_items(&second)[0].is(&first));

        let mut ser = Serializer::new(Vec::new(), SerOptions::new().proto(2)).unwrap();
        ser.dump(&shared).unwrap();
        ser.clear_memo();
        ser.dump(&shared).unwrap();
        assert_eq!(ser.into_inner(), b"\x80\x02]q\x00K\x07a.\x80\x02]q\x00K\x07a.");
    }

    #[test]
    fn sets_and_frozensets() {
        let items = BTreeSet::from_iter(vec![HashableValue::I64(1), HashableValue::I64(2)]);
        let set = Value::set(items.clone());
        assert_eq!(value_to_vec(&set, SerOptions::new().proto(4)).unwrap(),
                   b"\x80\x04\x95\x09\x00\x00\x00\x00\x00\x00\x00\x8f\x94(K\x01K\x02\x90.");
        assert_eq!(value_to_vec(&set, SerOptions::new().proto(3)).unwrap(),
                   b"\x80\x03cbuiltins\nset\nq\x00]q\x01(K\x01K\x02e\x85Rq\x02.".to_vec());
        let frozen = Value::frozenset(items);
        assert_eq!(value_to_vec(&frozen, SerOptions::new().proto(4)).unwrap(),
                   b"\x80\x04\x95\x08\x00\x00\x00\x00\x00\x00\x00(K\x01K\x02\x91\x94.");
        for proto in 0..=5 {
            assert_eq!(roundtrip(&set, proto), set);
            assert_eq!(roundtrip(&frozen, proto), frozen);
        }
    }

    #[test]
    fn global_encodings() {
        let global = Value::global("collections", "OrderedDict");
        assert_eq!(value_to_vec(&global, SerOptions::new().proto(2)).unwrap(),
                   b"\x80\x02ccollections\nOrderedDict\nq\x00.".to_vec());
        let twice = Value::list(vec![global.clone(), global.clone()]);
        let tripped = roundtrip(&twice, 4);
        assert_eq!(tripped, twice);
        for proto in 0..=5 {
            assert_eq!(roundtrip(&global, proto), global);
        }
    }

    #[test]
    fn version_gating() {
        let nested = Value::global("collections", "OrderedDict.fromkeys");
        for proto in 0..4 {
            match value_to_vec(&nested, SerOptions::new().proto(proto)) {
                Err(Error::ProtocolMismatch { requested, required: 4 }) => assert_eq!(requested, proto),
                other => panic!("unexpected result {:?}", other),
            }
        }
        assert_eq!(roundtrip(&nested, 4), nested);

        match value_to_vec(&Value::None, SerOptions::new().proto(6)) {
            Err(Error::UnsupportedProtocol(6)) => {}
            other => panic!("unexpected result {:?}", other),
        }
        match value_from_slice(b"\x80\x06N.", DeOptions::new()) {
            Err(Error::Eval(ErrorCode::UnsupportedProtocol(6), 2)) => {}
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn large_payloads_are_not_framed() {
        let big = Value::String("x".repeat(70_000));
        let vec = value_to_vec(&big, SerOptions::new()).unwrap();
        assert_eq!(&vec[..3], b"\x80\x05X");
        assert_eq!(&vec[3..7], &70_000u32.to_le_bytes());
        assert_eq!(vec.len(), 2 + 5 + 70_000 + 1);
        assert_eq!(*vec.last().unwrap(), b'.');
        assert_eq!(value_from_slice(&vec, DeOptions::new()).unwrap(), big);
    }

    #[test]
    fn long_streams_use_several_frames() {
        let list = Value::list((0..100_000).map(Value::I64).collect());
        for &proto in &[4, 5] {
            let vec = value_to_vec(&list, SerOptions::new().proto(proto)).unwrap();
            assert_eq!(vec[2], 0x95);
            let mut len = [0u8; 8];
            len.copy_from_slice(&vec[3..11]);
            let len = u64::from_le_bytes(len) as usize;
            assert!(len >= 64 * 1024);
            assert_eq!(vec[11 + len], 0x95);
            assert_eq!(value_from_slice(&vec, DeOptions::new()).unwrap(), list);
        }
    }

    #[test]
    fn payloads_do_not_overfill_frames() {
        let text = Value::String("a".repeat(40_000));
        let list = Value::list(vec![text.clone(), text]);
        let vec = value_to_vec(&list, SerOptions::new().proto(4)).unwrap();
        let frame_len = |at: usize| {
            let mut len = [0u8; 8];
            len.copy_from_slice(&vec[at + 1..at + 9]);
            u64::from_le_bytes(len) as usize
        };
        // EMPTY_LIST, MEMOIZE, MARK and the first string.
        assert_eq!(vec[2], 0x95);
        assert_eq!(frame_len(2), 3 + 5 + 40_000);
        // The second string, APPENDS and STOP.
        let second = 11 + frame_len(2);
        assert_eq!(vec[second], 0x95);
        assert_eq!(frame_len(second), 5 + 40_000 + 2);
        assert_eq!(vec.len(), second + 9 + frame_len(second));
        assert_eq!(value_from_slice(&vec, DeOptions::new()).unwrap(), list);
    }

    #[test]
    fn frame_errors() {
        let good = b"\x80\x04\x95\x0b\x00\x00\x00\x00\x00\x00\x00]\x94(K\x01K\x02K\x03e.";
        for cut in 1..12 {
            match value_from_slice(&good[..good.len() - cut], DeOptions::new()) {
                Err(Error::Eval(ErrorCode::TruncatedFrame { declared: 11, available }, _)) =>
                    assert_eq!(available as usize, 11 - cut),
                other => panic!("unexpected result {:?}", other),
            }
        }
        // An operand running past the end of its frame.
        let straddle = b"\x80\x04\x95\x03\x00\x00\x00\x00\x00\x00\x00J\x00\x00\x00\x00.";
        match value_from_slice(straddle, DeOptions::new()) {
            Err(Error::Eval(ErrorCode::FrameExhausted, _)) => {}
            other => panic!("unexpected result {:?}", other),
        }
        // A frame starting inside another one.
        let overlap = b"\x80\x04\x95\x0b\x00\x00\x00\x00\x00\x00\x00\x95\x01\x00\x00\x00\x00\x00\x00\x00N.";
        match value_from_slice(overlap, DeOptions::new()) {
            Err(Error::Eval(ErrorCode::FrameOverlap(2), _)) => {}
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn corrupt_streams() {
        let cases: &[&[u8]] = &[
            b"",
            b"\x80\x02",
            b"\x80\x02N",
            b"\x80\x02NN.",
            b"\x80\x02(N.",
            b"\x80\x02h\x05.",
            b"\x80\x02e.",
            b"\x80\x02K\x01a.",
            b"\x80\x02}]K\x01s.",
            b"\x80\x02B\x05\x00\x00\x00ab",
            b"\x80\x02T\xff\xff\xff\xff.",
        ];
        for &case in cases {
            match value_from_slice(case, DeOptions::new()) {
                Err(Error::Eval(_, _)) => {}
                other => panic!("unexpected result {:?} for {:?}", other, case),
            }
        }
        match value_from_slice(b"\x80\x02NN.", DeOptions::new()) {
            Err(Error::Eval(ErrorCode::UnbalancedStack(2), _)) => {}
            other => panic!("unexpected result {:?}", other),
        }
        match value_from_slice(b"\x80\x02N.N", DeOptions::new()) {
            Err(Error::Eval(ErrorCode::TrailingBytes, 4)) => {}
            other => panic!("unexpected result {:?}", other),
        }
        match value_from_slice(b"\x80\x05P0\n.", DeOptions::new()) {
            Err(Error::Eval(ErrorCode::Unsupported('P'), _)) => {}
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn stack_manipulation() {
        assert_eq!(value_from_slice(b"\x80\x02NK\x010.", DeOptions::new()).unwrap(), Value::None);
        assert_eq!(value_from_slice(b"\x80\x02N(K\x01K\x021.", DeOptions::new()).unwrap(), Value::None);
        let dup = value_from_slice(b"\x80\x02]2\x86.", DeOptions::new()).unwrap();
        match dup {
            Value::Tuple(ref t) => assert!(t[0].is(&t[1])),
            other => panic!("not a tuple: {:?}", other),
        }
        assert_eq!(value_from_slice(b"\x80\x02\x96\x02\x00\x00\x00\x00\x00\x00\x00ab.",
                                    DeOptions::new()).unwrap(),
                   Value::Bytes(b"ab".to_vec()));
    }

    #[test]
    fn fuzzing() {
        // Tries to ensure that we don't panic when encountering strange streams.
        for _ in 0..1000 {
            let mut stream = [0u8; 1000];
            thread_rng().fill_bytes(&mut stream);
            if *stream.last().unwrap() == b'.' { continue; }
            // These must all fail with an error, since we skip the check if the
            // last byte is a STOP opcode.
            assert!(value_from_slice(&stream, DeOptions::new()).is_err());
        }
    }

    #[test]
    fn qc_roundtrip() {
        fn roundtrip_tree(tree: Tree) -> bool {
            let original = tree.to_value();
            (0..=5).all(|proto| {
                let vec = value_to_vec(&original, SerOptions::new().proto(proto)).unwrap();
                value_from_slice(&vec, DeOptions::new()).unwrap() == original
            })
        }
        QuickCheck::new().gen(StdGen::new(thread_rng(), 10))
                         .tests(2000)
                         .quickcheck(roundtrip_tree as fn(Tree) -> bool);
    }

    #[test]
    fn roundtrip_json() {
        let original: serde_json::Value = serde_json::from_str(r#"[
            {"null": null,
             "false": false,
             "true": true,
             "int": -1238571,
             "float": 1.5e10,
             "list": [false, 5, "true", 3.8]
            }
        ]"#).unwrap();
        let value: Value = serde_json::from_value(original.clone()).unwrap();
        for proto in 0..=5 {
            let tripped = roundtrip(&value, proto);
            assert_eq!(serde_json::to_value(&tripped).unwrap(), original);
        }
    }

    #[test]
    fn json_refuses_cycles() {
        let list = Value::list(vec![]);
        if let Value::List(ref l) = list {
            l.borrow_mut().push(list.clone());
        }
        assert!(serde_json::to_string(&list).is_err());
        if let Value::List(ref l) = list {
            l.borrow_mut().clear();
        }
        let shared = Value::list(vec![Value::I64(1)]);
        let acyclic = Value::tuple(vec![shared.clone(), shared]);
        assert_eq!(serde_json::to_string(&acyclic).unwrap(), "[[1],[1]]");
    }
}

mod object_tests {
    use std::any::Any;
    use std::cell::Cell;
    use std::collections::BTreeMap;
    use std::rc::Rc;
    use crate::{value_from_slice, value_to_vec, DeOptions, SerOptions, Serializer};
    use crate::{Construct, Constructor, Instance, Object, Reduce, Reducer, ResolvePolicy, TupleReducer};
    use crate::{Global, Value, HashableValue};
    use crate::error::{Error, ErrorCode, Result};

    fn point_instance() -> Value {
        let instance = Instance::new(Construct::New {
            class: Global::new("geom", "Shape"),
            args: vec![Value::I64(3)],
        });
        instance.set_state(Value::dict(treemap!(
            HashableValue::String("x".into()) => Value::I64(1),
            HashableValue::String("y".into()) => Value::I64(2)
        ))).unwrap();
        Value::object(instance)
    }

    #[test]
    fn python_instance() {
        // class Point: pass; p = Point(); p.x = 1; p.y = 2; pickle.dumps(p, 2)
        let stream = b"\x80\x02c__main__\nPoint\nq\x00)\x81q\x01}q\x02(X\x01\x00\x00\x00xq\x03\
                       K\x01X\x01\x00\x00\x00yq\x04K\x02ub.";
        let value = value_from_slice(stream, DeOptions::new()).unwrap();
        let instance = match value {
            Value::Object(ref o) => o.as_any().downcast_ref::<Instance>().unwrap(),
            ref other => panic!("not an object: {:?}", other),
        };
        assert_eq!(instance.class(), &Global::new("__main__", "Point"));
        assert_eq!(instance.construct(), &Construct::New {
            class: Global::new("__main__", "Point"),
            args: vec![],
        });
        assert_eq!(instance.state(), Some(Value::dict(treemap!(
            HashableValue::String("x".into()) => Value::I64(1),
            HashableValue::String("y".into()) => Value::I64(2)
        ))));
        for proto in 0..=5 {
            let vec = value_to_vec(&value, SerOptions::new().proto(proto)).unwrap();
            assert_eq!(value_from_slice(&vec, DeOptions::new()).unwrap(), value);
        }
    }

    #[test]
    fn old_style_instance() {
        // Python 2 old-style class, protocol 0.
        let stream = b"(i__main__\nOld\np0\n(dp1\nS'a'\np2\nI1\nsb.";
        let value = value_from_slice(stream, DeOptions::new().decode_strings()).unwrap();
        let instance = match value {
            Value::Object(ref o) => o.as_any().downcast_ref::<Instance>().unwrap(),
            ref other => panic!("not an object: {:?}", other),
        };
        assert_eq!(instance.construct(), &Construct::New {
            class: Global::new("__main__", "Old"),
            args: vec![],
        });
        assert_eq!(instance.state(), Some(Value::dict(treemap!(
            HashableValue::String("a".into()) => Value::I64(1)
        ))));
        let obj = value_from_slice(b"(c__main__\nOld\nK\x01o.", DeOptions::new()).unwrap();
        let instance = match obj {
            Value::Object(ref o) => o.as_any().downcast_ref::<Instance>().unwrap(),
            ref other => panic!("not an object: {:?}", other),
        };
        assert_eq!(instance.construct(), &Construct::Call {
            callable: Global::new("__main__", "Old"),
            args: vec![Value::I64(1)],
        });
    }

    #[test]
    fn generic_objects_roundtrip() {
        let value = point_instance();
        for proto in 0..=5 {
            let vec = value_to_vec(&value, SerOptions::new().proto(proto)).unwrap();
            assert_eq!(value_from_slice(&vec, DeOptions::new()).unwrap(), value, "protocol {}", proto);
        }
        // Below protocol 2, NEWOBJ is spelled as a call of copyreg.__newobj__.
        let vec = value_to_vec(&value, SerOptions::new().proto(1)).unwrap();
        assert!(vec.starts_with(b"ccopyreg\n__newobj__\n"));
    }

    #[test]
    fn newobj_ex_needs_protocol_4() {
        let value = Value::object(Instance::new(Construct::NewEx {
            class: Global::new("geom", "Shape"),
            args: vec![Value::I64(1)],
            kwargs: treemap!("sides".to_string() => Value::I64(4)),
        }));
        for proto in 0..4 {
            match value_to_vec(&value, SerOptions::new().proto(proto)) {
                Err(Error::ProtocolMismatch { required: 4, .. }) => {}
                other => panic!("unexpected result {:?}", other),
            }
        }
        for proto in 4..=5 {
            let vec = value_to_vec(&value, SerOptions::new().proto(proto)).unwrap();
            assert_eq!(value_from_slice(&vec, DeOptions::new()).unwrap(), value);
        }
    }

    #[test]
    fn list_and_dict_items() {
        let instance = Instance::new(Construct::Call {
            callable: Global::new("collections", "OrderedDict"),
            args: vec![],
        });
        instance.set_item(Value::String("k".into()), Value::I64(1)).unwrap();
        instance.append(Value::None).unwrap();
        let value = Value::object(instance);
        for proto in 0..=5 {
            let vec = value_to_vec(&value, SerOptions::new().proto(proto)).unwrap();
            assert_eq!(value_from_slice(&vec, DeOptions::new()).unwrap(), value);
        }
    }

    #[test]
    fn allow_list() {
        let vec = value_to_vec(&point_instance(), SerOptions::new().proto(2)).unwrap();
        match value_from_slice(&vec, DeOptions::new().policy(ResolvePolicy::allow(vec![]))) {
            Err(Error::Unresolved(ref global, _)) => assert_eq!(global, &Global::new("geom", "Shape")),
            other => panic!("unexpected result {:?}", other),
        }
        let allowed = ResolvePolicy::allow(vec![Global::new("geom", "Shape")]);
        assert_eq!(value_from_slice(&vec, DeOptions::new().policy(allowed)).unwrap(), point_instance());

        // Plain data constructors are always available.
        let set = Value::set(vec![HashableValue::I64(1)].into_iter().collect());
        let vec = value_to_vec(&Value::tuple(vec![set.clone(), Value::Bytes(b"x".to_vec())]),
                               SerOptions::new().proto(2)).unwrap();
        assert_eq!(value_from_slice(&vec, DeOptions::new().policy(ResolvePolicy::allow(vec![]))).unwrap(),
                   Value::tuple(vec![set, Value::Bytes(b"x".to_vec())]));

        // Bare references are checked as well.
        let vec = value_to_vec(&Value::global("os", "system"), SerOptions::new()).unwrap();
        match value_from_slice(&vec, DeOptions::new().policy(ResolvePolicy::allow(vec![]))) {
            Err(Error::Unresolved(..)) => {}
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[derive(Debug, Default)]
    struct Point {
        xy: Cell<(i64, i64)>,
    }

    impl Object for Point {
        fn type_name(&self) -> String {
            "geom.Point".into()
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn object_eq(&self, other: &dyn Object) -> bool {
            other.as_any().downcast_ref::<Point>().map_or(false, |p| p.xy.get() == self.xy.get())
        }
    }

    struct PointReducer;

    impl Reducer for PointReducer {
        fn reduce(&self, object: &Rc<dyn Object>, _proto: u8) -> Result<Option<Reduce>> {
            Ok(object.as_any().downcast_ref::<Point>().map(|p| {
                let (x, y) = p.xy.get();
                let mut reduce = Reduce::new(Construct::New {
                    class: Global::new("geom", "Point"),
                    args: vec![],
                }).with_state(Value::tuple(vec![Value::I64(x), Value::I64(y)]));
                reduce.state_setter = Some(Global::new("geom", "set_point"));
                reduce
            }))
        }
    }

    fn new_point(_args: Vec<Value>) -> Result<Value> {
        Ok(Value::object(Point::default()))
    }

    fn set_point(args: Vec<Value>) -> Result<Value> {
        let bad = || Error::Syntax(ErrorCode::InvalidValue("bad set_point call".into()));
        match (&args[0], &args[1]) {
            (Value::Object(o), Value::Tuple(t)) => {
                let point = o.as_any().downcast_ref::<Point>().ok_or_else(bad)?;
                match (&t[0], &t[1]) {
                    (Value::I64(x), Value::I64(y)) => point.xy.set((*x, *y)),
                    _ => return Err(bad()),
                }
                Ok(Value::None)
            }
            _ => Err(bad()),
        }
    }

    fn geom_resolver(global: &Global) -> Option<Rc<dyn Constructor>> {
        match (&*global.module, &*global.name) {
            ("geom", "Point") => Some(Rc::new(new_point)),
            ("geom", "set_point") => Some(Rc::new(set_point)),
            _ => None,
        }
    }

    #[test]
    fn host_objects_with_state_setter() {
        let point = Point::default();
        point.xy.set((3, 4));
        let value = Value::list(vec![Value::object(point)]);
        match value_to_vec(&value, SerOptions::new()) {
            Err(Error::NotSerializable(ref name)) => assert_eq!(name, "geom.Point"),
            other => panic!("unexpected result {:?}", other),
        }
        for proto in 0..=5 {
            let vec = value_to_vec(&value, SerOptions::new().proto(proto).reducer(PointReducer)).unwrap();
            let tripped = value_from_slice(&vec, DeOptions::new().resolver(geom_resolver)).unwrap();
            assert_eq!(tripped, value, "protocol {}", proto);
        }
        // Without the resolver, the setter call becomes a generic object.
        let vec = value_to_vec(&value, SerOptions::new().reducer(PointReducer)).unwrap();
        assert!(value_from_slice(&vec, DeOptions::new()).is_ok());
        // The resolver is authoritative.
        let vec = value_to_vec(&point_instance(), SerOptions::new()).unwrap();
        match value_from_slice(&vec, DeOptions::new().resolver(geom_resolver)) {
            Err(Error::Unresolved(ref global, _)) => assert_eq!(global, &Global::new("geom", "Shape")),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn failed_dump_does_not_leak_into_next_dump() {
        for &proto in &[2, 4] {
            let shared = Value::list(vec![Value::I64(1)]);
            let mut ser = Serializer::new(Vec::new(), SerOptions::new().proto(proto)).unwrap();
            let broken = Value::list(vec![shared.clone(), Value::object(Point::default())]);
            match ser.dump(&broken) {
                Err(Error::NotSerializable(ref name)) => assert_eq!(name, "geom.Point"),
                other => panic!("unexpected result: {:?}", other),
            }
            ser.dump(&shared).unwrap();
            let out = ser.into_inner();
            let expected: &[u8] = if proto == 2 {
                b"\x80\x02]q\x00K\x01a."
            } else {
                b"\x80\x04\x95\x06\x00\x00\x00\x00\x00\x00\x00]\x94K\x01a."
            };
            assert!(out.ends_with(expected), "protocol {}: {:?}", proto, out);
            let start = out.len() - expected.len();
            let tripped = value_from_slice(&out[start..], DeOptions::new()).unwrap();
            assert_eq!(tripped, shared);
        }
    }

    #[derive(Debug)]
    struct Celsius(f64);

    impl Object for Celsius {
        fn type_name(&self) -> String {
            "units.Celsius".into()
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn tuple_reducer() {
        let reducer = TupleReducer(|object: &dyn Object| {
            object.as_any().downcast_ref::<Celsius>().map(|c| Value::tuple(vec![
                Value::global("units", "Celsius"),
                Value::tuple(vec![Value::F64(c.0)]),
            ]))
        });
        let value = Value::object(Celsius(21.5));
        let vec = value_to_vec(&value, SerOptions::new().proto(3).reducer(reducer)).unwrap();
        assert_eq!(vec, b"\x80\x03cunits\nCelsius\nq\x00G@5\x80\x00\x00\x00\x00\x00\x85Rq\x01.".to_vec());
        let decoded = value_from_slice(&vec, DeOptions::new()).unwrap();
        match decoded {
            Value::Object(ref o) => {
                let instance = o.as_any().downcast_ref::<Instance>().unwrap();
                assert_eq!(instance.construct(), &Construct::Call {
                    callable: Global::new("units", "Celsius"),
                    args: vec![Value::F64(21.5)],
                });
            }
            ref other => panic!("not an object: {:?}", other),
        }
    }

    #[test]
    fn reduce_tuples() {
        let g = Value::global("m", "f");
        match Reduce::from_value(&Value::tuple(vec![g.clone()])) {
            Err(Error::Syntax(ErrorCode::ReduceArity(1))) => {}
            other => panic!("unexpected result {:?}", other),
        }
        match Reduce::from_value(&Value::tuple(vec![Value::None; 7])) {
            Err(Error::Syntax(ErrorCode::ReduceArity(7))) => {}
            other => panic!("unexpected result {:?}", other),
        }
        let reduce = Reduce::from_value(&Value::tuple(vec![
            Value::global("copyreg", "__newobj__"),
            Value::tuple(vec![g.clone(), Value::I64(1)]),
            Value::None,
            Value::list(vec![Value::I64(2)]),
        ])).unwrap();
        assert_eq!(reduce.construct, Construct::New {
            class: Global::new("m", "f"),
            args: vec![Value::I64(1)],
        });
        assert_eq!(reduce.state, None);
        assert_eq!(reduce.list_items, vec![Value::I64(2)]);
        let kwargs: BTreeMap<HashableValue, Value> =
            treemap!(HashableValue::String("k".into()) => Value::I64(3));
        let reduce = Reduce::from_value(&Value::tuple(vec![
            Value::global("copyreg", "__newobj_ex__"),
            Value::tuple(vec![g, Value::tuple(vec![]), Value::dict(kwargs)]),
        ])).unwrap();
        assert_eq!(reduce.construct, Construct::NewEx {
            class: Global::new("m", "f"),
            args: vec![],
            kwargs: treemap!("k".to_string() => Value::I64(3)),
        });
    }

    struct SelfArgReducer;

    impl Reducer for SelfArgReducer {
        fn reduce(&self, object: &Rc<dyn Object>, _proto: u8) -> Result<Option<Reduce>> {
            Ok(Some(Reduce::new(Construct::Call {
                callable: Global::new("units", "Celsius"),
                args: vec![Value::Object(object.clone())],
            })))
        }
    }

    #[test]
    fn object_in_own_arguments() {
        let value = Value::object(Celsius(0.0));
        match value_to_vec(&value, SerOptions::new().reducer(SelfArgReducer)) {
            Err(Error::Recursive(ref name)) => assert_eq!(name, "units.Celsius"),
            other => panic!("unexpected result {:?}", other),
        }
    }
}

mod ext_tests {
    use std::thread;
    use crate::{value_from_slice, value_to_vec, DeOptions, SerOptions};
    use crate::{add_extension, remove_extension, extension_code, extension_global};
    use crate::{Global, Value};
    use crate::error::{Error, ErrorCode};

    #[test]
    fn extension_opcodes() {
        let cases: &[(&str, u32, &[u8])] = &[
            ("Ext1", 0xe1, b"\x80\x02\x82\xe1."),
            ("Ext2", 0x1092, b"\x80\x02\x83\x92\x10."),
            ("Ext4", 0x0123_4567, b"\x80\x02\x84\x67\x45\x23\x01."),
        ];
        for &(name, code, bytes) in cases {
            add_extension("ext_tests", name, code).unwrap();
            let global = Value::global("ext_tests", name);
            assert_eq!(value_to_vec(&global, SerOptions::new().proto(2)).unwrap(), bytes);
            assert_eq!(value_from_slice(bytes, DeOptions::new()).unwrap(), global);
            for proto in 0..=5 {
                let vec = value_to_vec(&global, SerOptions::new().proto(proto)).unwrap();
                assert_eq!(value_from_slice(&vec, DeOptions::new()).unwrap(), global);
            }
            remove_extension("ext_tests", name, code).unwrap();
        }
    }

    #[test]
    fn registry_conflicts() {
        add_extension("ext_tests", "Taken", 0x5001).unwrap();
        // Identical registration is fine.
        add_extension("ext_tests", "Taken", 0x5001).unwrap();
        match add_extension("ext_tests", "Other", 0x5001) {
            Err(Error::Registry(ErrorCode::ExtensionCodeTaken(0x5001, _))) => {}
            other => panic!("unexpected result {:?}", other),
        }
        match add_extension("ext_tests", "Taken", 0x5002) {
            Err(Error::Registry(ErrorCode::ExtensionGlobalTaken(_, 0x5001))) => {}
            other => panic!("unexpected result {:?}", other),
        }
        for &code in &[0, 0x8000_0000] {
            match add_extension("ext_tests", "Range", code) {
                Err(Error::Registry(ErrorCode::ExtensionCodeRange(_))) => {}
                other => panic!("unexpected result {:?}", other),
            }
        }
        assert!(remove_extension("ext_tests", "Taken", 0x5002).is_err());
        remove_extension("ext_tests", "Taken", 0x5001).unwrap();
        assert_eq!(extension_code(&Global::new("ext_tests", "Taken")), None);
    }

    #[test]
    fn unknown_extension() {
        match value_from_slice(b"\x80\x02\x82\xfe.", DeOptions::new()) {
            Err(Error::Eval(ErrorCode::UnknownExtension(0xfe), _)) => {}
            other => panic!("unexpected result {:?}", other),
        }
        match value_from_slice(b"\x80\x02\x82\x00.", DeOptions::new()) {
            Err(Error::Eval(ErrorCode::ExtensionCodeRange(0), _)) => {}
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn concurrent_registration() {
        let handles: Vec<_> = (0..8u32).map(|i| thread::spawn(move || {
            let name = format!("Thread{}", i);
            add_extension("ext_tests", &name, 0x6000 + i).unwrap();
            assert_eq!(extension_global(0x6000 + i), Some(Global::new("ext_tests", name)));
        })).collect();
        for handle in handles {
            handle.join().unwrap();
        }
        for i in 0..8u32 {
            let name = format!("Thread{}", i);
            assert_eq!(extension_code(&Global::new("ext_tests", name.as_str())), Some(0x6000 + i));
            remove_extension("ext_tests", &name, 0x6000 + i).unwrap();
        }
    }
}
