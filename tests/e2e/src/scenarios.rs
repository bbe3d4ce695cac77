use alloc::string::String;
use alloc::vec::Vec;

use pretty_assertions::assert_eq;

use jigvm_runtime::abi::TypeNode;
use jigvm_runtime::args::ArgsWriter;
use jigvm_runtime::container::ModuleContainer;
use jigvm_runtime::execution::CREATED_ORIGIN_BASE;
use jigvm_runtime::host::CallFrame;
use jigvm_runtime::memory::{GuestMemory, WasmWord};
use jigvm_runtime::package::package_id;
use jigvm_runtime::statement::StatementValue;
use jigvm_runtime::{Instruction, Lock, Output, Pointer, Tx, TxExecution};

use crate::fixtures::{self, badge, coin, names_state, TestKey, BADGE_SOURCE};
use crate::harness::{names_arg, no_args, origin_at, sign_all, sign_to, TestHarness};

fn alice() -> TestKey {
    TestKey::from_seed("alice")
}

fn bob() -> TestKey {
    TestKey::from_seed("bob")
}

/// LOAD a fresh coin owned by `owner` and FUND with it.
fn push_funding(h: &TestHarness, tx: &mut Tx, owner: &TestKey) -> Output {
    let coin = h.mint_coin(owner, 1000);
    let idx = tx.instructions.len() as u16;
    tx.push(Instruction::Load { output_id: coin.id() })
        .push(Instruction::Fund { idx });
    coin
}

/// Create a badge locked to `owner` and return its origin.
fn create_badge(h: &TestHarness, owner: &TestKey, names: &[&str]) -> Pointer {
    let mut tx = Tx::new();
    tx.push(Instruction::Import { pkg_id: h.badge_pkg })
        .push(Instruction::New {
            idx: 0,
            export_idx: 0,
            args: names_arg(names),
        })
        .push(Instruction::Lock {
            idx: 1,
            address: owner.address(),
        });
    if h.vm.config().min_fund_amount > 0 {
        push_funding(h, &mut tx, owner);
        sign_all(&mut tx, &[owner]);
    }
    h.execute(&tx).unwrap();
    origin_at(&tx, 1)
}

fn badge_lifecycle_tx(h: &TestHarness) -> (Tx, Output) {
    let alice = alice();
    let mut tx = Tx::new();
    tx.push(Instruction::Import { pkg_id: h.badge_pkg })
        .push(Instruction::New {
            idx: 0,
            export_idx: 0,
            args: names_arg(&["foo"]),
        })
        .push(Instruction::Call {
            idx: 1,
            method_idx: badge::RENAME,
            args: names_arg(&["bar"]),
        })
        .push(Instruction::Lock {
            idx: 1,
            address: alice.address(),
        });
    let coin = push_funding(h, &mut tx, &alice);
    sign_all(&mut tx, &[&alice]);
    (tx, coin)
}

#[test]
fn test_new_rename_lock_sign_yields_one_badge_output() {
    let h = TestHarness::new();
    let alice = alice();
    let (tx, coin) = badge_lifecycle_tx(&h);
    let result = h.execute(&tx).unwrap();

    let badge_class = Pointer::new(h.badge_pkg, 0);
    let badges: Vec<&Output> = result
        .outputs
        .iter()
        .filter(|o| o.class_ptr == badge_class)
        .collect();
    assert_eq!(badges.len(), 1);
    let out = badges[0];
    assert_eq!(out.origin, origin_at(&tx, 1));
    assert_eq!(out.location, Pointer::new(tx.hash(), 0));
    assert_eq!(out.state, names_state(&["bar"]));
    assert_eq!(out.lock, Lock::Address(alice.address()));
    assert_eq!(h.latest(&out.origin), *out);

    let spent_coin = result.output_by_origin(&coin.origin).unwrap();
    assert_eq!(spent_coin.lock, Lock::Frozen);
    assert_eq!(spent_coin.state, coin.state);
    assert_eq!(result.spends, alloc::vec![coin]);
    assert!(result.reads.is_empty());
}

#[test]
fn test_same_tx_same_snapshot_same_outputs() {
    let run = || {
        let h = TestHarness::new();
        let (tx, _) = badge_lifecycle_tx(&h);
        h.execute(&tx).unwrap()
    };
    assert_eq!(run(), run());
}

#[test]
fn test_lock_without_signature_is_denied() {
    let h = TestHarness::with_min_fund(0);
    let origin = create_badge(&h, &alice(), &["foo"]);
    let badge = h.latest(&origin);

    let mut tx = Tx::new();
    tx.push(Instruction::Load { output_id: badge.id() })
        .push(Instruction::Lock {
            idx: 0,
            address: bob().address(),
        });
    let err = h.execute(&tx).unwrap_err();
    assert!(err.is_auth(), "{}", err);
    assert_eq!(err.instruction_index(), Some(1));

    sign_all(&mut tx, &[&bob()]);
    assert!(h.execute(&tx).unwrap_err().is_auth());
    assert_eq!(h.latest(&origin), badge);
}

#[test]
fn test_call_needs_covering_signature() {
    let h = TestHarness::with_min_fund(0);
    let alice = alice();
    let origin = create_badge(&h, &alice, &["foo"]);
    let badge = h.latest(&origin);
    let rename = Instruction::Call {
        idx: 0,
        method_idx: badge::RENAME,
        args: names_arg(&["baz"]),
    };

    let mut unsigned = Tx::new();
    unsigned
        .push(Instruction::Load { output_id: badge.id() })
        .push(rename.clone());
    assert_eq!(h.execute(&unsigned).unwrap_err().instruction_index(), Some(1));

    let mut too_early = Tx::new();
    too_early.push(Instruction::Load { output_id: badge.id() });
    sign_to(&mut too_early, &alice);
    too_early.push(rename.clone());
    let err = h.execute(&too_early).unwrap_err();
    assert!(err.is_auth());
    assert_eq!(err.instruction_index(), Some(2));

    let mut covered = Tx::new();
    covered
        .push(Instruction::Load { output_id: badge.id() })
        .push(rename);
    sign_to(&mut covered, &alice);
    let result = h.execute(&covered).unwrap();
    assert_eq!(result.outputs[0].state, names_state(&["baz"]));
    assert_eq!(result.spends, alloc::vec![badge]);
}

#[test]
fn test_frozen_is_terminal() {
    let h = TestHarness::with_min_fund(0);
    let alice = alice();
    let origin = create_badge(&h, &alice, &["foo"]);

    let mut freeze = Tx::new();
    freeze
        .push(Instruction::LoadByOrigin { origin })
        .push(Instruction::Call {
            idx: 0,
            method_idx: badge::FREEZE,
            args: no_args(),
        });
    sign_all(&mut freeze, &[&alice]);
    let result = h.execute(&freeze).unwrap();
    assert_eq!(result.outputs[0].lock, Lock::Frozen);

    let mut rename = Tx::new();
    rename
        .push(Instruction::LoadByOrigin { origin })
        .push(Instruction::Call {
            idx: 0,
            method_idx: badge::RENAME,
            args: names_arg(&["x"]),
        });
    sign_all(&mut rename, &[&alice]);
    assert!(h.execute(&rename).unwrap_err().is_auth());

    let mut relock = Tx::new();
    relock
        .push(Instruction::LoadByOrigin { origin })
        .push(Instruction::Lock {
            idx: 0,
            address: alice.address(),
        });
    sign_all(&mut relock, &[&alice]);
    assert!(h.execute(&relock).unwrap_err().is_auth());
}

#[test]
fn test_funding_coin_is_frozen_afterwards() {
    let h = TestHarness::new();
    let alice = alice();
    let (tx, coin) = badge_lifecycle_tx(&h);
    h.execute(&tx).unwrap();

    let mut spend_again = Tx::new();
    spend_again
        .push(Instruction::LoadByOrigin { origin: coin.origin })
        .push(Instruction::Call {
            idx: 0,
            method_idx: coin::VALUE,
            args: no_args(),
        });
    sign_all(&mut spend_again, &[&alice]);
    let err = h.execute(&spend_again).unwrap_err();
    assert!(err.is_auth());
    assert_eq!(err.instruction_index(), Some(1));
}

#[test]
fn test_coin_of_someone_else_cannot_fund() {
    let h = TestHarness::new();
    let mut tx = Tx::new();
    tx.push(Instruction::Import { pkg_id: h.badge_pkg })
        .push(Instruction::New {
            idx: 0,
            export_idx: 0,
            args: names_arg(&["foo"]),
        })
        .push(Instruction::Lock {
            idx: 1,
            address: alice().address(),
        });
    push_funding(&h, &mut tx, &bob());
    sign_all(&mut tx, &[&alice()]);
    let err = h.execute(&tx).unwrap_err();
    assert!(err.is_auth());
    assert_eq!(err.instruction_index(), Some(4));
}

#[test]
fn test_underfunded_tx_is_rejected() {
    let h = TestHarness::new();
    let alice = alice();
    let mut tx = Tx::new();
    tx.push(Instruction::Import { pkg_id: h.badge_pkg })
        .push(Instruction::New {
            idx: 0,
            export_idx: 0,
            args: names_arg(&["foo"]),
        })
        .push(Instruction::Lock {
            idx: 1,
            address: alice.address(),
        });
    let err = h.execute(&tx).unwrap_err();
    assert!(err.is_execution());
    assert_eq!(err.instruction_index(), None);

    let coin = h.mint_coin(&alice, 50);
    tx.push(Instruction::Load { output_id: coin.id() })
        .push(Instruction::Fund { idx: 3 });
    sign_all(&mut tx, &[&alice]);
    assert!(h.execute(&tx).unwrap_err().is_execution());
}

#[test]
fn test_unlocked_jig_cannot_be_committed() {
    let h = TestHarness::with_min_fund(0);
    let mut tx = Tx::new();
    tx.push(Instruction::Import { pkg_id: h.badge_pkg })
        .push(Instruction::New {
            idx: 0,
            export_idx: 0,
            args: names_arg(&["foo"]),
        });
    let err = h.execute(&tx).unwrap_err();
    assert!(err.is_permission(), "{}", err);
}

#[test]
fn test_adopted_child_only_answers_to_parent() {
    let h = TestHarness::with_min_fund(0);
    let alice = alice();
    let mut tx = Tx::new();
    tx.push(Instruction::Import { pkg_id: h.badge_pkg })
        .push(Instruction::New {
            idx: 0,
            export_idx: 0,
            args: names_arg(&["parent"]),
        })
        .push(Instruction::New {
            idx: 0,
            export_idx: 0,
            args: names_arg(&["child"]),
        })
        .push(Instruction::Call {
            idx: 1,
            method_idx: badge::ADOPT,
            args: ArgsWriter::new().jig(2).build(),
        })
        .push(Instruction::Lock {
            idx: 1,
            address: alice.address(),
        });
    let result = h.execute(&tx).unwrap();
    let (parent, child) = (origin_at(&tx, 1), origin_at(&tx, 2));
    assert_eq!(result.outputs.len(), 2);
    assert_eq!(result.output_by_origin(&child).unwrap().lock, Lock::Jig(parent));

    let mut direct = Tx::new();
    direct
        .push(Instruction::LoadByOrigin { origin: child })
        .push(Instruction::Call {
            idx: 0,
            method_idx: badge::RENAME,
            args: names_arg(&["orphan"]),
        });
    sign_all(&mut direct, &[&alice]);
    let err = h.execute(&direct).unwrap_err();
    assert!(err.is_auth());
    assert_eq!(err.instruction_index(), Some(1));
}

#[test]
fn test_returned_value_passed_by_reference() {
    let h = TestHarness::with_min_fund(0);
    let alice = alice();
    let mut tx = Tx::new();
    tx.push(Instruction::Import { pkg_id: h.badge_pkg })
        .push(Instruction::New {
            idx: 0,
            export_idx: 0,
            args: names_arg(&["foo", "x"]),
        })
        .push(Instruction::Call {
            idx: 1,
            method_idx: badge::NAMES,
            args: no_args(),
        })
        .push(Instruction::New {
            idx: 0,
            export_idx: 0,
            args: ArgsWriter::new().reference(2).build(),
        })
        .push(Instruction::Lock {
            idx: 1,
            address: alice.address(),
        })
        .push(Instruction::Lock {
            idx: 3,
            address: alice.address(),
        });
    let result = h.execute(&tx).unwrap();
    let states: Vec<&[u8]> = result.outputs.iter().map(|o| o.state.as_slice()).collect();
    let expected = names_state(&["foo", "x"]);
    assert_eq!(states, alloc::vec![expected.as_slice(), expected.as_slice()]);
    assert_eq!(result.outputs[1].origin, origin_at(&tx, 3));
}

#[test]
fn test_untouched_jigs_are_reads() {
    let h = TestHarness::with_min_fund(0);
    let alice = alice();
    let a = create_badge(&h, &alice, &["a"]);
    let b = create_badge(&h, &alice, &["b"]);
    let b_before = h.latest(&b);

    let mut tx = Tx::new();
    tx.push(Instruction::LoadByOrigin { origin: a })
        .push(Instruction::LoadByOrigin { origin: b })
        .push(Instruction::Call {
            idx: 0,
            method_idx: badge::CAN_LOCK,
            args: ArgsWriter::new().jig(1).build(),
        });
    sign_all(&mut tx, &[&alice]);
    let result = h.execute(&tx).unwrap();
    assert_eq!(result.outputs.len(), 1);
    assert_eq!(result.outputs[0].origin, a);
    assert_eq!(result.reads, alloc::vec![b_before]);
}

#[test]
fn test_double_spend_rejected_at_persist() {
    let h = TestHarness::new();
    let alice = alice();
    let coin = h.mint_coin(&alice, 1000);
    let make = |name: &str| {
        let mut tx = Tx::new();
        tx.push(Instruction::Import { pkg_id: h.badge_pkg })
            .push(Instruction::New {
                idx: 0,
                export_idx: 0,
                args: names_arg(&[name]),
            })
            .push(Instruction::Lock {
                idx: 1,
                address: alice.address(),
            })
            .push(Instruction::Load { output_id: coin.id() })
            .push(Instruction::Fund { idx: 3 });
        sign_all(&mut tx, &[&alice]);
        tx
    };
    h.execute(&make("first")).unwrap();
    let err = h.execute(&make("second")).unwrap_err();
    assert!(err.is_execution());
}

#[test]
fn test_deploy_inside_transaction() {
    let h = TestHarness::with_min_fund(0);
    let alice = alice();
    let entries = alloc::vec![String::from(BADGE_SOURCE)];
    let sources = fixtures::sources(BADGE_SOURCE);
    let mut tx = Tx::new();
    tx.push(Instruction::Deploy {
        entries: entries.clone(),
        sources: sources.clone(),
    })
    .push(Instruction::New {
        idx: 0,
        export_idx: 0,
        args: names_arg(&["fresh"]),
    })
    .push(Instruction::Lock {
        idx: 1,
        address: alice.address(),
    });
    let result = h.execute(&tx).unwrap();

    let id = package_id(&entries, &sources);
    assert_eq!(result.deploys.len(), 1);
    assert_eq!(result.deploys[0].id, id);
    assert_eq!(result.outputs[0].class_ptr, Pointer::new(id, 0));
    assert!(h.vm.storage().has_package(&id));
}

fn value_at(exec: &TxExecution<'_>, idx: u16) -> (String, WasmWord) {
    match &exec.statements().get(idx).unwrap().value {
        StatementValue::Value { ty, word, .. } => (ty.name.clone(), *word),
        other => panic!("statement {} is {:?}", idx, other),
    }
}

#[test]
fn test_statement_values_and_method_rules() {
    let h = TestHarness::with_min_fund(0);
    let mut exec = h.execution();
    let new_badge = |name: &str| Instruction::New {
        idx: 0,
        export_idx: 0,
        args: names_arg(&[name]),
    };
    assert_eq!(exec.execute(&Instruction::Import { pkg_id: h.badge_pkg }).unwrap(), 0);
    assert_eq!(exec.execute(&new_badge("a")).unwrap(), 1);
    assert_eq!(exec.execute(&new_badge("b")).unwrap(), 2);

    exec.execute(&Instruction::Call {
        idx: 1,
        method_idx: badge::CAN_LOCK,
        args: ArgsWriter::new().jig(2).build(),
    })
    .unwrap();
    assert_eq!(value_at(&exec, 3), (String::from("bool"), WasmWord::from_bool(true)));

    exec.execute(&Instruction::Exec {
        idx: 0,
        export_idx: 0,
        method_idx: badge::VERSION,
        args: no_args(),
    })
    .unwrap();
    assert_eq!(value_at(&exec, 4).1.to_u32(), 3);

    exec.execute(&Instruction::ExecFunc {
        idx: 0,
        export_idx: 1,
        args: ArgsWriter::new().u32(2).u32(40).build(),
    })
    .unwrap();
    assert_eq!(value_at(&exec, 5).1.to_u32(), 42);

    let call = |method_idx| Instruction::Call {
        idx: 1,
        method_idx,
        args: no_args(),
    };
    assert!(exec.execute(&call(badge::SECRET)).unwrap_err().is_permission());
    assert!(exec.execute(&call(badge::VERSION)).unwrap_err().is_permission());
    assert!(exec.execute(&call(badge::FAIL)).unwrap_err().is_execution());
    assert!(exec
        .execute(&Instruction::Exec {
            idx: 0,
            export_idx: 0,
            method_idx: badge::NAMES,
            args: no_args(),
        })
        .unwrap_err()
        .is_permission());
    assert!(exec.execute(&call(99)).unwrap_err().is_not_found());
}

#[test]
fn test_guest_trap_names_instruction() {
    let h = TestHarness::with_min_fund(0);
    let mut tx = Tx::new();
    tx.push(Instruction::Import { pkg_id: h.badge_pkg })
        .push(Instruction::New {
            idx: 0,
            export_idx: 0,
            args: names_arg(&["foo"]),
        })
        .push(Instruction::Call {
            idx: 1,
            method_idx: badge::FAIL,
            args: no_args(),
        });
    let err = h.execute(&tx).unwrap_err();
    assert!(err.is_execution());
    assert_eq!(err.instruction_index(), Some(2));
}

#[test]
fn test_container_marshals_through_guest_memory() {
    let mut container = ModuleContainer::new([1u8; 32], &fixtures::badge_wasm(), fixtures::badge_abi()).unwrap();
    let ty = TypeNode::with_args("Array", alloc::vec![TypeNode::new("string")]);
    let bytes = names_state(&["héllo", "wörld", ""]);

    let words = container.lowerer().lower_args(&bytes, core::slice::from_ref(&ty)).unwrap();
    assert_eq!(container.lifter().lift(&ty, words[0]).unwrap(), bytes);

    let (rtid, size) = container.header(words[0].to_u32()).unwrap();
    assert_eq!((rtid, size), (fixtures::STRING_ARRAY_RTID, 16));
}

#[test]
fn test_container_pins_and_traps() {
    let mut container = ModuleContainer::new([1u8; 32], &fixtures::badge_wasm(), fixtures::badge_abi()).unwrap();
    let ptr = container.malloc(4, 1).unwrap();
    container.retain(ptr).unwrap();
    container.retain(ptr).unwrap();
    assert_eq!(container.pin_count(ptr), 2);
    container.release(ptr).unwrap();
    assert_eq!(container.pin_count(ptr), 1);
    container.release_all().unwrap();
    assert_eq!(container.pin_count(ptr), 0);
    assert!(container.release(ptr).is_err());

    let (result, _) = container.call("__Badge_fail", &[ptr], CallFrame::default());
    assert!(result.unwrap_err().is_execution());
    let (result, _) = container.call("sum", &[WasmWord::from_u32(1), WasmWord::from_u32(2)], CallFrame::default());
    assert_eq!(result.unwrap().map(WasmWord::to_u32), Some(3));
    assert!(container.read(u32::MAX - 2, 8).is_err());
}

#[test]
fn test_parent_renames_its_child_through_the_host() {
    let h = TestHarness::with_min_fund(0);
    let alice = alice();
    let mut setup = Tx::new();
    setup
        .push(Instruction::Import { pkg_id: h.badge_pkg })
        .push(Instruction::New {
            idx: 0,
            export_idx: 0,
            args: names_arg(&["parent"]),
        })
        .push(Instruction::New {
            idx: 0,
            export_idx: 0,
            args: names_arg(&["child"]),
        })
        .push(Instruction::Call {
            idx: 1,
            method_idx: badge::ADOPT,
            args: ArgsWriter::new().jig(2).build(),
        })
        .push(Instruction::Lock {
            idx: 1,
            address: alice.address(),
        });
    h.execute(&setup).unwrap();
    let (parent, child) = (origin_at(&setup, 1), origin_at(&setup, 2));

    let mut tx = Tx::new();
    tx.push(Instruction::LoadByOrigin { origin: parent })
        .push(Instruction::LoadByOrigin { origin: child })
        .push(Instruction::Call {
            idx: 0,
            method_idx: badge::RENAME_CHILD,
            args: ArgsWriter::new().jig(1).strings(&["grown"]).build(),
        });
    sign_all(&mut tx, &[&alice]);
    let result = h.execute(&tx).unwrap();
    assert_eq!(result.outputs.len(), 2);
    let renamed = result.output_by_origin(&child).unwrap();
    assert_eq!(renamed.state, names_state(&["grown"]));
    assert_eq!(renamed.lock, Lock::Jig(parent));
    assert_eq!(h.latest(&child).state, names_state(&["grown"]));
}

#[test]
fn test_spawned_child_gets_created_origin_and_parent_lock() {
    let h = TestHarness::with_min_fund(0);
    let alice = alice();
    let mut tx = Tx::new();
    tx.push(Instruction::Import { pkg_id: h.badge_pkg })
        .push(Instruction::New {
            idx: 0,
            export_idx: 0,
            args: names_arg(&["parent"]),
        })
        .push(Instruction::Call {
            idx: 1,
            method_idx: badge::SPAWN,
            args: names_arg(&["kid"]),
        })
        .push(Instruction::Lock {
            idx: 1,
            address: alice.address(),
        });
    let result = h.execute(&tx).unwrap();
    let parent = origin_at(&tx, 1);
    let kid = Pointer::new(tx.hash(), CREATED_ORIGIN_BASE);
    assert_eq!(result.outputs.len(), 2);
    let spawned = result.output_by_origin(&kid).unwrap();
    assert_eq!(spawned.lock, Lock::Jig(parent));
    assert_eq!(spawned.state, names_state(&["kid"]));
    assert_eq!(spawned.class_ptr, Pointer::new(h.badge_pkg, 0));

    let mut exec = h.execution();
    for ix in &tx.instructions[..3] {
        exec.execute(ix).unwrap();
    }
    assert!(matches!(
        exec.statements().get(2).unwrap().value,
        StatementValue::Jig(origin) if origin.idx == CREATED_ORIGIN_BASE
    ));
}

#[test]
fn test_reading_a_coin_from_another_package() {
    let h = TestHarness::with_min_fund(0);
    let alice = alice();
    let coin = h.mint_coin(&alice, 250);
    let steps = [
        Instruction::Import { pkg_id: h.badge_pkg },
        Instruction::New {
            idx: 0,
            export_idx: 0,
            args: names_arg(&["reader"]),
        },
        Instruction::Load { output_id: coin.id() },
    ];

    let mut exec = h.execution();
    for ix in &steps {
        exec.execute(ix).unwrap();
    }
    exec.execute(&Instruction::Call {
        idx: 1,
        method_idx: badge::COIN_AMOUNT,
        args: ArgsWriter::new().jig(2).build(),
    })
    .unwrap();
    let (ty, word) = value_at(&exec, 3);
    assert_eq!((ty.as_str(), word.to_u64()), ("u64", 250));
    let err = exec
        .execute(&Instruction::Call {
            idx: 1,
            method_idx: badge::COIN_VALUE,
            args: ArgsWriter::new().jig(2).build(),
        })
        .unwrap_err();
    assert!(err.is_auth(), "{}", err);

    let mut tx = Tx::new();
    for ix in steps {
        tx.push(ix);
    }
    tx.push(Instruction::Call {
        idx: 1,
        method_idx: badge::COIN_VALUE,
        args: ArgsWriter::new().jig(2).build(),
    })
    .push(Instruction::Lock {
        idx: 1,
        address: alice.address(),
    });
    sign_all(&mut tx, &[&alice]);
    let result = h.execute(&tx).unwrap();
    let spent = result.output_by_origin(&coin.origin).unwrap();
    assert_eq!(spent.state, 250u64.to_le_bytes().to_vec());
    assert_eq!(result.outputs.len(), 2);
}

#[test]
fn test_static_method_relays_to_package_function() {
    let h = TestHarness::with_min_fund(0);
    let mut exec = h.execution();
    exec.execute(&Instruction::Import { pkg_id: h.badge_pkg }).unwrap();
    let pkg = h.badge_pkg;
    exec.execute(&Instruction::Exec {
        idx: 0,
        export_idx: 0,
        method_idx: badge::RELAY_SUM,
        args: ArgsWriter::new()
            .value(|w| {
                w.write_bytes(&pkg);
            })
            .u32(19)
            .u32(23)
            .build(),
    })
    .unwrap();
    assert_eq!(value_at(&exec, 1), (String::from("u32"), WasmWord::from_u32(42)));
}

#[test]
fn test_load_hydrates_jigs_of_imported_packages() {
    let h = TestHarness::with_min_fund(0);
    let alice = alice();
    let a = create_badge(&h, &alice, &["a"]);
    let b = create_badge(&h, &alice, &["b"]);

    let mut exec = h.execution();
    exec.execute(&Instruction::LoadByOrigin { origin: a }).unwrap();
    assert!(exec.jig(&a).unwrap().local_ptr().is_none());

    exec.execute(&Instruction::Import { pkg_id: h.badge_pkg }).unwrap();
    exec.execute(&Instruction::LoadByOrigin { origin: b }).unwrap();
    assert!(exec.jig(&b).unwrap().local_ptr().is_some());
}

#[test]
fn test_references_must_match_the_parameter_type() {
    let h = TestHarness::with_min_fund(0);
    let alice = alice();
    let coin = h.mint_coin(&alice, 5);
    let mut exec = h.execution();
    exec.execute(&Instruction::Import { pkg_id: h.badge_pkg }).unwrap();
    exec.execute(&Instruction::New {
        idx: 0,
        export_idx: 0,
        args: names_arg(&["a"]),
    })
    .unwrap();
    exec.execute(&Instruction::Call {
        idx: 1,
        method_idx: badge::NAMES,
        args: no_args(),
    })
    .unwrap();
    exec.execute(&Instruction::Load { output_id: coin.id() }).unwrap();

    let names_as_u32 = Instruction::ExecFunc {
        idx: 0,
        export_idx: 1,
        args: ArgsWriter::new().reference(2).u32(1).build(),
    };
    assert!(exec.execute(&names_as_u32).unwrap_err().is_execution());

    let coin_as_badge = Instruction::Call {
        idx: 1,
        method_idx: badge::ADOPT,
        args: ArgsWriter::new().jig(3).build(),
    };
    assert!(exec.execute(&coin_as_badge).unwrap_err().is_execution());

    let badge_as_badge = Instruction::Call {
        idx: 1,
        method_idx: badge::CAN_LOCK,
        args: ArgsWriter::new().reference(1).build(),
    };
    exec.execute(&badge_as_badge).unwrap();
}
