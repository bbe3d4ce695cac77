//! Guest packages and collaborators used by the end-to-end tests.
//!
//! Two hand-assembled packages stand in for compiled guest code:
//!
//! - **badge**: `class Badge { names: Array<string> }` with methods that
//!   rename, freeze, adopt other badges and query authorization, methods
//!   that compose with other jigs through the host (rename a child, spawn
//!   one, read a coin), plus the free function `sum(a, b)`.
//! - **coin**: the built-in `Coin { amount: u64 }` used to fund transactions.
//!
//! Both use a bump allocator behind `__new` that writes the 8-byte object
//! header the host expects. Method and class names handed to the host live
//! in static data below the heap, headers included.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use jigvm_runtime::abi::{
    Abi, ArgNode, ClassNode, CodeDef, FieldNode, FunctionNode, MethodKind, MethodNode, TypeIdNode, TypeNode,
    ABI_VERSION,
};
use jigvm_runtime::codec::BufWriter;
use jigvm_runtime::layout::{BUF_RTID, STRING_RTID};
use jigvm_runtime::lock::{LOCK_FROZEN, LOCK_JIG};
use jigvm_runtime::package::{CompiledPackage, Compiler};
use jigvm_runtime::signature::SignatureVerifier;
use jigvm_runtime::{Address, Result, VmError};

use crate::wasm::{Code, ModuleBuilder, ValType};

use ValType::{I32, I64};

pub const BADGE_SOURCE: &str = "badge.ts";
pub const COIN_SOURCE: &str = "coin.ts";

pub const OUTPUT_RTID: u32 = 3;
pub const LOCK_RTID: u32 = 4;
pub const BADGE_RTID: u32 = 5;
pub const STRING_ARRAY_RTID: u32 = 6;
pub const COIN_RTID: u32 = 7;

/// Method indexes of `Badge`, in ABI order.
pub mod badge {
    pub const RENAME: u16 = 0;
    pub const NAMES: u16 = 1;
    pub const FREEZE: u16 = 2;
    pub const ADOPT: u16 = 3;
    pub const CAN_LOCK: u16 = 4;
    pub const SECRET: u16 = 5;
    pub const FAIL: u16 = 6;
    pub const VERSION: u16 = 7;
    pub const RENAME_CHILD: u16 = 8;
    pub const SPAWN: u16 = 9;
    pub const COIN_VALUE: u16 = 10;
    pub const COIN_AMOUNT: u16 = 11;
    pub const RELAY_SUM: u16 = 12;
}

/// Method indexes of `Coin`.
pub mod coin {
    pub const VALUE: u16 = 0;
}

/// Heap starts well above address zero so null stays invalid.
const HEAP_BASE: i32 = 1024;

/// Static strings of the badge module.
const RENAME_STR: u32 = 64;
const VALUE_STR: u32 = 128;
const AMOUNT_STR: u32 = 192;
const BADGE_STR: u32 = 256;
const SUM_STR: u32 = 320;

/// `__new(size, rtid) -> ptr`: bump allocate with an 8-byte header.
fn allocator(m: &mut ModuleBuilder, heap: u32) -> u32 {
    let (size, rtid, ptr) = (0, 1, 2);
    let body = Code::new()
        .global_get(heap)
        .i32_const(15)
        .i32_add()
        .i32_const(-8)
        .i32_and()
        .local_set(ptr)
        // rtid at ptr - 8
        .local_get(ptr)
        .i32_const(8)
        .i32_sub()
        .local_get(rtid)
        .i32_store(0)
        // size at ptr - 4
        .local_get(ptr)
        .i32_const(4)
        .i32_sub()
        .local_get(size)
        .i32_store(0)
        .local_get(ptr)
        .local_get(size)
        .i32_add()
        .global_set(heap)
        .local_get(ptr)
        .finish();
    m.func(&[I32, I32], &[I32], &[I32], body)
}

/// A static object at `addr`, preceded by its header.
fn static_object(m: &mut ModuleBuilder, addr: u32, rtid: u32, payload: &[u8]) {
    let mut bytes = Vec::with_capacity(8 + payload.len());
    bytes.extend_from_slice(&rtid.to_le_bytes());
    bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    bytes.extend_from_slice(payload);
    m.data(addr - 8, &bytes);
}

fn static_string(m: &mut ModuleBuilder, addr: u32, s: &str) {
    let payload: Vec<u8> = s.encode_utf16().flat_map(u16::to_le_bytes).collect();
    static_object(m, addr, STRING_RTID, &payload);
}

/// Allocate an argument buffer of `words` i32 slots into local `buf` and
/// fill it from `locals`.
fn pack_args(code: &mut Code, alloc: u32, buf: u32, locals: &[u32]) {
    code.i32_const(locals.len() as i32 * 4)
        .i32_const(BUF_RTID as i32)
        .call(alloc)
        .local_set(buf);
    for (i, local) in locals.iter().enumerate() {
        code.local_get(buf).local_get(*local).i32_store(i as u32 * 4);
    }
}

/// Push the origin buffer of the jig or proxy in local `idx`.
fn origin_of(code: &mut Code, idx: u32) -> &mut Code {
    code.local_get(idx).i32_load(0).i32_load(0)
}

pub fn badge_wasm() -> Vec<u8> {
    let mut m = ModuleBuilder::new();
    let jig_lock = m.import_func("vm", "jig_lock", &[I32, I32, I32], &[]);
    let auth_check = m.import_func("vm", "jig_auth_check", &[I32, I32], &[I32]);
    let call_method = m.import_func("vm", "call_method", &[I32, I32, I32], &[I64]);
    let get_prop = m.import_func("vm", "get_prop", &[I32, I32], &[I64]);
    let constructor_local = m.import_func("vm", "constructor_local", &[I32, I32], &[I32]);
    let call_function = m.import_func("vm", "call_function", &[I32, I32, I32], &[I64]);
    let heap = m.global_i32(HEAP_BASE);
    let alloc = allocator(&mut m, heap);

    let constructor = m.func(
        &[I32],
        &[I32],
        &[I32],
        Code::new()
            .i32_const(12)
            .i32_const(BADGE_RTID as i32)
            .call(alloc)
            .local_set(1)
            .local_get(1)
            .local_get(0)
            .i32_store(8)
            .local_get(1)
            .finish(),
    );
    let rename = m.func(
        &[I32, I32],
        &[],
        &[],
        Code::new().local_get(0).local_get(1).i32_store(8).finish(),
    );
    let names = m.func(&[I32], &[I32], &[], Code::new().local_get(0).i32_load(8).finish());

    let mut freeze = Code::new();
    origin_of(&mut freeze, 0)
        .i32_const(i32::from(LOCK_FROZEN))
        .i32_const(0)
        .call(jig_lock);
    let freeze = m.func(&[I32], &[], &[], freeze.finish());

    let mut adopt = Code::new();
    origin_of(&mut adopt, 1)
        .i32_const(i32::from(LOCK_JIG))
        .i32_const(0)
        .call(jig_lock);
    let adopt = m.func(&[I32, I32], &[], &[], adopt.finish());

    let mut can_lock = Code::new();
    origin_of(&mut can_lock, 1).i32_const(1).call(auth_check);
    let can_lock = m.func(&[I32, I32], &[I32], &[], can_lock.finish());

    let secret = m.func(&[I32], &[], &[], Code::new().finish());
    let fail = m.func(&[I32], &[], &[], Code::new().unreachable().finish());
    let version = m.func(&[], &[I32], &[], Code::new().i32_const(3).finish());
    let sum = m.func(
        &[I32, I32],
        &[I32],
        &[],
        Code::new().local_get(0).local_get(1).i32_add().finish(),
    );

    // renameChild(child, names): child.rename(names)
    let mut rename_child = Code::new();
    pack_args(&mut rename_child, alloc, 3, &[2]);
    origin_of(&mut rename_child, 1)
        .i32_const(RENAME_STR as i32)
        .local_get(3)
        .call(call_method)
        .drop();
    let rename_child = m.func(&[I32, I32, I32], &[], &[I32], rename_child.finish());

    // spawn(names): new Badge(names), adopted by this
    let mut spawn = Code::new();
    pack_args(&mut spawn, alloc, 2, &[1]);
    spawn
        .i32_const(BADGE_STR as i32)
        .local_get(2)
        .call(constructor_local)
        .local_set(3);
    origin_of(&mut spawn, 3)
        .i32_const(i32::from(LOCK_JIG))
        .i32_const(0)
        .call(jig_lock)
        .local_get(3);
    let spawn = m.func(&[I32, I32], &[I32], &[I32, I32], spawn.finish());

    // coinValue(coin): coin.value()
    let mut coin_value = Code::new();
    origin_of(&mut coin_value, 1)
        .i32_const(VALUE_STR as i32)
        .i32_const(0)
        .call(call_method);
    let coin_value = m.func(&[I32, I32], &[I64], &[], coin_value.finish());

    // coinAmount(coin): coin.amount
    let mut coin_amount = Code::new();
    origin_of(&mut coin_amount, 1).i32_const(AMOUNT_STR as i32).call(get_prop);
    let coin_amount = m.func(&[I32, I32], &[I64], &[], coin_amount.finish());

    // static relaySum(pkg, a, b): pkg.sum(a, b)
    let mut relay_sum = Code::new();
    pack_args(&mut relay_sum, alloc, 3, &[1, 2]);
    relay_sum
        .local_get(0)
        .i32_const(SUM_STR as i32)
        .local_get(3)
        .call(call_function)
        .i32_wrap_i64();
    let relay_sum = m.func(&[I32, I32, I32], &[I32], &[I32], relay_sum.finish());

    static_string(&mut m, RENAME_STR, "rename");
    static_string(&mut m, VALUE_STR, "value");
    static_string(&mut m, AMOUNT_STR, "amount");
    static_string(&mut m, BADGE_STR, "Badge");
    static_string(&mut m, SUM_STR, "sum");

    m.memory(2)
        .export_func("__new", alloc)
        .export_func("__Badge_constructor", constructor)
        .export_func("__Badge_rename", rename)
        .export_func("__Badge_names", names)
        .export_func("__Badge_freeze", freeze)
        .export_func("__Badge_adopt", adopt)
        .export_func("__Badge_canLock", can_lock)
        .export_func("__Badge_secret", secret)
        .export_func("__Badge_fail", fail)
        .export_func("__Badge_version", version)
        .export_func("__Badge_renameChild", rename_child)
        .export_func("__Badge_spawn", spawn)
        .export_func("__Badge_coinValue", coin_value)
        .export_func("__Badge_coinAmount", coin_amount)
        .export_func("__Badge_relaySum", relay_sum)
        .export_func("sum", sum);
    m.build()
}

pub fn coin_wasm() -> Vec<u8> {
    let mut m = ModuleBuilder::new();
    let heap = m.global_i32(HEAP_BASE);
    let alloc = allocator(&mut m, heap);
    let constructor = m.func(
        &[I64],
        &[I32],
        &[I32],
        Code::new()
            .i32_const(16)
            .i32_const(COIN_RTID as i32)
            .call(alloc)
            .local_set(1)
            .local_get(1)
            .local_get(0)
            .i64_store(8)
            .local_get(1)
            .finish(),
    );
    let value = m.func(&[I32], &[I64], &[], Code::new().local_get(0).i64_load(8).finish());
    m.memory(2)
        .export_func("__new", alloc)
        .export_func("__Coin_constructor", constructor)
        .export_func("__Coin_value", value);
    m.build()
}

fn t(name: &str) -> TypeNode {
    TypeNode::new(name)
}

fn string_array() -> TypeNode {
    TypeNode::with_args("Array", alloc::vec![t("string")])
}

fn arg(name: &str, ty: TypeNode) -> ArgNode {
    ArgNode {
        name: String::from(name),
        ty,
    }
}

fn method(name: &str, args: Vec<ArgNode>, rtype: Option<TypeNode>) -> MethodNode {
    MethodNode {
        kind: MethodKind::Public,
        is_static: false,
        name: String::from(name),
        args,
        rtype,
    }
}

fn type_id(id: u32, name: &str) -> TypeIdNode {
    TypeIdNode {
        id,
        name: String::from(name),
    }
}

fn common_type_ids() -> Vec<TypeIdNode> {
    alloc::vec![type_id(OUTPUT_RTID, "Output"), type_id(LOCK_RTID, "Lock")]
}

pub fn badge_abi() -> Abi {
    let class = ClassNode {
        name: String::from("Badge"),
        extends: Some(String::from("Jig")),
        implements: alloc::vec![],
        fields: alloc::vec![FieldNode {
            name: String::from("names"),
            ty: string_array(),
        }],
        methods: alloc::vec![
            method("constructor", alloc::vec![arg("names", string_array())], None),
            method("rename", alloc::vec![arg("names", string_array())], None),
            method("names", alloc::vec![], Some(string_array())),
            method("freeze", alloc::vec![], None),
            method("adopt", alloc::vec![arg("child", t("Badge"))], None),
            method("canLock", alloc::vec![arg("other", t("Badge"))], Some(t("bool"))),
            MethodNode {
                kind: MethodKind::Protected,
                ..method("secret", alloc::vec![], None)
            },
            method("fail", alloc::vec![], None),
            MethodNode {
                is_static: true,
                ..method("version", alloc::vec![], Some(t("u32")))
            },
            method(
                "renameChild",
                alloc::vec![arg("child", t("Badge")), arg("names", string_array())],
                None,
            ),
            method("spawn", alloc::vec![arg("names", string_array())], Some(t("Badge"))),
            method("coinValue", alloc::vec![arg("coin", t("Coin"))], Some(t("u64"))),
            method("coinAmount", alloc::vec![arg("coin", t("Coin"))], Some(t("u64"))),
            MethodNode {
                is_static: true,
                ..method(
                    "relaySum",
                    alloc::vec![arg("pkg", t("ArrayBuffer")), arg("a", t("u32")), arg("b", t("u32"))],
                    Some(t("u32")),
                )
            },
        ],
    };
    let sum = FunctionNode {
        name: String::from("sum"),
        args: alloc::vec![arg("a", t("u32")), arg("b", t("u32"))],
        rtype: Some(t("u32")),
    };
    let mut type_ids = common_type_ids();
    type_ids.push(type_id(BADGE_RTID, "Badge"));
    type_ids.push(type_id(STRING_ARRAY_RTID, "Array<string>"));
    type_ids.push(type_id(COIN_RTID, "Coin"));
    Abi {
        version: ABI_VERSION,
        exports: alloc::vec![0, 1],
        imports: alloc::vec![],
        defs: alloc::vec![CodeDef::Class(class), CodeDef::Function(sum)],
        type_ids,
    }
}

pub fn coin_abi() -> Abi {
    let class = ClassNode {
        name: String::from("Coin"),
        extends: Some(String::from("Jig")),
        implements: alloc::vec![],
        fields: alloc::vec![FieldNode {
            name: String::from("amount"),
            ty: t("u64"),
        }],
        methods: alloc::vec![
            method("constructor", alloc::vec![arg("amount", t("u64"))], None),
            method("value", alloc::vec![], Some(t("u64"))),
        ],
    };
    let mut type_ids = common_type_ids();
    type_ids.push(type_id(COIN_RTID, "Coin"));
    Abi {
        version: ABI_VERSION,
        exports: alloc::vec![0],
        imports: alloc::vec![],
        defs: alloc::vec![CodeDef::Class(class)],
        type_ids,
    }
}

/// Source map for one of the fixture packages.
pub fn sources(file: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    map.insert(String::from(file), alloc::format!("// fixture {}", file));
    map
}

/// Serialized `Array<string>` value.
pub fn names_state(names: &[&str]) -> Vec<u8> {
    let mut w = BufWriter::new();
    w.write_uleb(names.len() as u64);
    for name in names {
        w.write_string(name);
    }
    w.into_bytes()
}

/// "Compiles" the fixture packages by entry file name.
#[derive(Debug, Default, Clone, Copy)]
pub struct TestCompiler;

impl Compiler for TestCompiler {
    fn compile(&self, entries: &[String], _sources: &BTreeMap<String, String>) -> Result<CompiledPackage> {
        let (wasm, abi) = match entries.first().map(String::as_str) {
            Some(BADGE_SOURCE) => (badge_wasm(), badge_abi()),
            Some(COIN_SOURCE) => (coin_wasm(), coin_abi()),
            other => {
                return Err(VmError::Execution(alloc::format!("cannot compile {:?}", other)));
            }
        };
        Ok(CompiledPackage {
            wasm,
            abi,
            docs: BTreeMap::new(),
        })
    }
}

/// Test key: the "signature" is a keyed hash any holder of the public key
/// can recompute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestKey {
    pub pubkey: [u8; 32],
}

impl TestKey {
    pub fn from_seed(seed: &str) -> Self {
        TestKey {
            pubkey: *blake3::hash(seed.as_bytes()).as_bytes(),
        }
    }

    pub fn address(&self) -> Address {
        Address::from_pubkey(&self.pubkey)
    }

    pub fn sign(&self, msg: &[u8; 32]) -> [u8; 64] {
        test_signature(&self.pubkey, msg)
    }
}

fn test_signature(pubkey: &[u8], msg: &[u8; 32]) -> [u8; 64] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(pubkey).update(msg);
    let mut sig = [0u8; 64];
    hasher.finalize_xof().fill(&mut sig);
    sig
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TestVerifier;

impl SignatureVerifier for TestVerifier {
    fn verify(&self, sig: &[u8], msg: &[u8; 32], pubkey: &[u8]) -> bool {
        sig == test_signature(pubkey, msg).as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jigvm_runtime::abi::AbiAccess;
    use jigvm_runtime::engine;

    #[test]
    fn test_fixture_modules_validate() {
        let engine = engine::get();
        assert!(engine::compile(&engine, &badge_wasm()).is_ok());
        assert!(engine::compile(&engine, &coin_wasm()).is_ok());
    }

    #[test]
    fn test_badge_layout() {
        let abi = AbiAccess::new(badge_abi()).unwrap();
        let class = abi.class_at(0).unwrap();
        assert_eq!(class.size, 12);
        assert_eq!(class.field("names").unwrap().offset, 8);
        assert_eq!(class.method_at(badge::VERSION).unwrap().name, "version");
        assert_eq!(class.method_at(badge::CAN_LOCK).unwrap().export_name(), "__Badge_canLock");
        assert_eq!(class.method_at(badge::RELAY_SUM).unwrap().name, "relaySum");
    }

    #[test]
    fn test_coin_layout() {
        let abi = AbiAccess::new(coin_abi()).unwrap();
        let class = abi.class_at(0).unwrap();
        assert_eq!(class.field("amount").unwrap().offset, 8);
        assert_eq!(class.size, 16);
    }

    #[test]
    fn test_signature_scheme() {
        let key = TestKey::from_seed("alice");
        let msg = [7u8; 32];
        let sig = key.sign(&msg);
        assert!(TestVerifier.verify(&sig, &msg, &key.pubkey));
        assert!(!TestVerifier.verify(&sig, &[8u8; 32], &key.pubkey));
        assert!(!TestVerifier.verify(&sig, &msg, &TestKey::from_seed("bob").pubkey));
    }
}
