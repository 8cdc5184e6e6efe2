use frankenffi_abi::{
    FunctionDescriptor, Linker, NativeArg, NativeValue, SymbolOrigin, ValueLayout, bind, resolve,
};
use frankenffi_membrane::{ArenaKind, ErrorKind, Primitive, StructLayout, with_arena};

fn scalar(kind: Primitive) -> ValueLayout {
    ValueLayout::scalar(kind)
}

#[test]
fn getpid_takes_no_arguments() {
    let linker = Linker::new();
    let getpid = linker
        .bind_symbol("getpid", &FunctionDescriptor::returning(Primitive::I32, []))
        .unwrap();
    let pid = getpid.invoke(&[]).unwrap();
    assert_eq!(pid, NativeValue::I32(std::process::id() as i32));
}

#[test]
fn signed_integers_round_trip() {
    let linker = Linker::new();
    let abs = linker
        .bind_symbol(
            "abs",
            &FunctionDescriptor::returning(Primitive::I32, [scalar(Primitive::I32)]),
        )
        .unwrap();
    assert_eq!(abs.invoke(&[NativeArg::I32(-42)]).unwrap(), NativeValue::I32(42));

    let labs = linker
        .bind_symbol(
            "labs",
            &FunctionDescriptor::returning(Primitive::I64, [scalar(Primitive::I64)]),
        )
        .unwrap();
    assert_eq!(
        labs.invoke(&[NativeArg::I64(-5_000_000_000)]).unwrap(),
        NativeValue::I64(5_000_000_000)
    );

    let toupper = linker
        .bind_symbol(
            "toupper",
            &FunctionDescriptor::returning(Primitive::I32, [scalar(Primitive::I32)]),
        )
        .unwrap();
    assert_eq!(
        toupper.invoke(&[NativeArg::I32(i32::from(b'q'))]).unwrap(),
        NativeValue::I32(i32::from(b'Q'))
    );
}

#[test]
fn float_return_from_pointer_arguments() {
    let strtod = bind(
        &resolve("strtod").unwrap(),
        FunctionDescriptor::returning(
            Primitive::F64,
            [ValueLayout::address(), ValueLayout::address()],
        ),
    )
    .unwrap();
    with_arena(ArenaKind::Confined, |arena| {
        let text = arena.allocate_cstr("19.25 EUR").unwrap();
        let out = strtod.invoke(&[NativeArg::from(&text), NativeArg::Null]).unwrap();
        assert_eq!(out, NativeValue::F64(19.25));

        // With an end pointer, strtod reports where parsing stopped.
        let end = arena.allocate(std::mem::size_of::<usize>()).unwrap();
        strtod.invoke(&[NativeArg::from(&text), NativeArg::from(&end)]).unwrap();
        let text_base = text.lease().unwrap().address();
        let stopped = end.read_scalar(0, Primitive::Address).unwrap();
        assert_eq!(
            stopped,
            frankenffi_membrane::ScalarValue::Address(text_base + 5)
        );
    });
}

#[test]
fn native_writes_are_visible_through_segments() {
    let memset = bind(
        &resolve("memset").unwrap(),
        FunctionDescriptor::returning(
            Primitive::Address,
            [ValueLayout::address(), scalar(Primitive::I32), scalar(Primitive::U64)],
        ),
    )
    .unwrap();
    with_arena(ArenaKind::Confined, |arena| {
        let seg = arena.allocate(20).unwrap();
        let out = memset
            .invoke(&[NativeArg::from(&seg), NativeArg::I32(0x7A), NativeArg::U64(12)])
            .unwrap();
        assert_eq!(out.as_address(), Some(seg.lease().unwrap().address()));
        let bytes = seg.to_vec().unwrap();
        assert!(bytes[..12].iter().all(|b| *b == 0x7A));
        assert!(bytes[12..].iter().all(|b| *b == 0));
    });
}

#[test]
fn mixed_register_classes() {
    // char *gcvt(double number, int ndigit, char *buf)
    let gcvt = bind(
        &resolve("gcvt").unwrap(),
        FunctionDescriptor::returning(
            Primitive::Address,
            [scalar(Primitive::F64), scalar(Primitive::I32), ValueLayout::address()],
        ),
    )
    .unwrap();
    with_arena(ArenaKind::Confined, |arena| {
        let buf = arena.allocate(32).unwrap();
        gcvt.invoke(&[NativeArg::F64(3.5), NativeArg::I32(6), NativeArg::from(&buf)])
            .unwrap();
        assert_eq!(buf.read_cstr(0).unwrap(), "3.5");
    });
}

#[test]
fn typed_pointee_layout_is_enforced() {
    let pair = StructLayout::builder()
        .field("lo", Primitive::U64)
        .field("hi", Primitive::U64)
        .build()
        .unwrap();
    let memset = bind(
        &resolve("memset").unwrap(),
        FunctionDescriptor::returning(
            Primitive::Address,
            [
                ValueLayout::address_of(pair.clone()),
                scalar(Primitive::I32),
                scalar(Primitive::U64),
            ],
        ),
    )
    .unwrap();
    with_arena(ArenaKind::Confined, |arena| {
        let too_small = arena.allocate(8).unwrap();
        let err = memset
            .invoke(&[NativeArg::from(&too_small), NativeArg::I32(1), NativeArg::U64(8)])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BoundsViolation);
        assert_eq!(too_small.to_vec().unwrap(), vec![0; 8]);

        let fits = arena.allocate_layout(pair).unwrap();
        memset
            .invoke(&[NativeArg::from(&fits), NativeArg::I32(0xFF), NativeArg::U64(16)])
            .unwrap();
        assert_eq!(
            fits.get("hi").unwrap(),
            frankenffi_membrane::ScalarValue::U64(u64::MAX)
        );
    });
}

#[test]
fn failed_invocations_leave_binding_usable() {
    let linker = Linker::new();
    let abs = linker
        .bind_symbol(
            "abs",
            &FunctionDescriptor::returning(Primitive::I32, [scalar(Primitive::I32)]),
        )
        .unwrap();
    assert_eq!(
        abs.invoke(&[NativeArg::I64(-1)]).unwrap_err().kind(),
        ErrorKind::TypeMismatch
    );
    assert_eq!(
        abs.invoke(&[NativeArg::I32(1), NativeArg::I32(2)])
            .unwrap_err()
            .kind(),
        ErrorKind::ArityMismatch
    );
    assert_eq!(abs.invoke(&[NativeArg::I32(-9)]).unwrap(), NativeValue::I32(9));
}

#[test]
fn mismatched_arguments_never_reach_memset() {
    let memset = Linker::new()
        .bind_symbol(
            "memset",
            &FunctionDescriptor::returning(
                Primitive::Address,
                [ValueLayout::address(), scalar(Primitive::I32), scalar(Primitive::U64)],
            ),
        )
        .unwrap();
    with_arena(ArenaKind::Confined, |arena| {
        let seg = arena.allocate(16).unwrap();
        seg.fill(0x11).unwrap();

        let short = memset
            .invoke(&[NativeArg::from(&seg), NativeArg::I32(0x7F)])
            .unwrap_err();
        assert_eq!(short.kind(), ErrorKind::ArityMismatch);

        // Only the last argument is wrong; the earlier ones must not be acted on.
        let mistyped = memset
            .invoke(&[NativeArg::from(&seg), NativeArg::I32(0x7F), NativeArg::I32(16)])
            .unwrap_err();
        assert_eq!(mistyped.kind(), ErrorKind::TypeMismatch);

        let swapped = memset
            .invoke(&[NativeArg::I32(0x7F), NativeArg::from(&seg), NativeArg::U64(16)])
            .unwrap_err();
        assert_eq!(swapped.kind(), ErrorKind::TypeMismatch);

        assert_eq!(seg.to_vec().unwrap(), vec![0x11; 16]);
    });
}

#[test]
fn binding_cache_reuses_identical_pairs() {
    let linker = Linker::new();
    let desc = FunctionDescriptor::returning(Primitive::I32, [scalar(Primitive::I32)]);
    let a = linker.bind_symbol("abs", &desc).unwrap();
    let b = linker.bind_symbol("abs", &desc).unwrap();
    assert_eq!(linker.cached_bindings(), 1);
    assert_eq!(a.symbol(), b.symbol());

    let wide = FunctionDescriptor::returning(Primitive::I64, [scalar(Primitive::I64)]);
    linker.bind_symbol("labs", &wide).unwrap();
    assert_eq!(linker.cached_bindings(), 2);

    assert_eq!(
        linker.bind_symbol("no_such_symbol_here", &desc).unwrap_err().kind(),
        ErrorKind::SymbolNotFound
    );
    assert_eq!(linker.cached_bindings(), 2);
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
#[test]
fn configured_libraries_are_searched_first() {
    let linker = Linker::new().with_library("libc.so.6").unwrap();
    let sym = linker.resolve("strlen").unwrap();
    match sym.origin() {
        SymbolOrigin::Library(lib) => assert_eq!(lib.path().to_str(), Some("libc.so.6")),
        SymbolOrigin::Process => panic!("expected library origin"),
    }
    assert_eq!(sym.address(), resolve("strlen").unwrap().address());
}
