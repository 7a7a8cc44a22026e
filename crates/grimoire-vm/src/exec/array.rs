//! Array instructions: build, index (reference, value and dual forms),
//! length, concatenate, append, prepend, structural equality.

use std::cell::RefCell;
use std::rc::Rc;

use crate::coroutine::Coroutine;
use crate::object::{obj_array_eq, ArrRef, Obj, SlotRef};

use super::{INDEX_ERROR, NULL_ERROR};

/// How an index opcode delivers its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMode {
    /// Push a write-through slot reference (`index_*`).
    Ref,
    /// Push the element value (`index2_*`).
    Value,
    /// Push both; the reference ends on top (`index3_*`).
    Both,
}

/// Wrap a negative index once, then bounds-check against `[0, len)`.
pub fn wrap_index(idx: i32, len: usize) -> Result<usize, &'static str> {
    let wrapped = if idx < 0 { idx as i64 + len as i64 } else { idx as i64 };
    if wrapped < 0 || wrapped >= len as i64 {
        Err(INDEX_ERROR)
    } else {
        Ok(wrapped as usize)
    }
}

/// Pop the top `n` values into a fresh array, preserving stack order.
pub fn build<T>(stack: &mut Vec<T>, n: usize) -> ArrRef<T> {
    let at = stack.len().saturating_sub(n);
    Rc::new(RefCell::new(stack.split_off(at)))
}

macro_rules! typed_array_ops {
    ($t:ty, $stack:ident, $pop:ident, $variant:ident, $slot:ident,
     $as_fn:ident, $index:ident, $length:ident, $concat:ident,
     $append:ident, $prepend:ident) => {
        pub fn $as_fn(obj: &Obj) -> Result<ArrRef<$t>, &'static str> {
            match obj {
                Obj::$variant(a) => Ok(a.clone()),
                _ => Err(NULL_ERROR),
            }
        }

        pub fn $index(co: &mut Coroutine, mode: IndexMode) -> Result<(), &'static str> {
            let idx = co.pop_int();
            let obj = co.pop_object();
            let arr = $as_fn(&obj)?;
            let len = arr.borrow().len();
            let i = wrap_index(idx, len)?;
            match mode {
                IndexMode::Ref => co.object_stack.push(Obj::Slot(SlotRef::$slot(arr, i))),
                IndexMode::Value => {
                    let v = arr.borrow()[i].clone();
                    co.$stack.push(v);
                }
                IndexMode::Both => {
                    // Value first: for the object kind both land on the
                    // object stack, and refStore pops the reference from
                    // the top.
                    let v = arr.borrow()[i].clone();
                    co.$stack.push(v);
                    co.object_stack.push(Obj::Slot(SlotRef::$slot(arr, i)));
                }
            }
            Ok(())
        }

        pub fn $length(co: &mut Coroutine) -> Result<(), &'static str> {
            let obj = co.pop_object();
            let arr = $as_fn(&obj)?;
            let len = arr.borrow().len() as i32;
            co.int_stack.push(len);
            Ok(())
        }

        pub fn $concat(co: &mut Coroutine) -> Result<(), &'static str> {
            let rhs = co.pop_object();
            let lhs = co.pop_object();
            let rhs = $as_fn(&rhs)?;
            let lhs = $as_fn(&lhs)?;
            let mut joined = lhs.borrow().clone();
            joined.extend(rhs.borrow().iter().cloned());
            co.object_stack.push(Obj::$variant(Rc::new(RefCell::new(joined))));
            Ok(())
        }

        // The array rides on top of the object stack; for the object kind
        // the value being appended is the slot beneath it.
        pub fn $append(co: &mut Coroutine) -> Result<(), &'static str> {
            let obj = co.pop_object();
            let arr = $as_fn(&obj)?;
            let v = co.$pop();
            arr.borrow_mut().push(v);
            co.object_stack.push(obj);
            Ok(())
        }

        pub fn $prepend(co: &mut Coroutine) -> Result<(), &'static str> {
            let obj = co.pop_object();
            let arr = $as_fn(&obj)?;
            let v = co.$pop();
            arr.borrow_mut().insert(0, v);
            co.object_stack.push(obj);
            Ok(())
        }
    };
}

typed_array_ops!(i32, int_stack, pop_int, Ints, Int, as_ints, index_int,
    length_int, concat_int, append_int, prepend_int);
typed_array_ops!(f32, float_stack, pop_float, Floats, Float, as_floats, index_float,
    length_float, concat_float, append_float, prepend_float);
typed_array_ops!(String, string_stack, pop_string, Strs, Str, as_strs, index_str,
    length_str, concat_str, append_str, prepend_str);
typed_array_ops!(Obj, object_stack, pop_object, Objs, Obj, as_objs, index_obj,
    length_obj, concat_obj, append_obj, prepend_obj);

/// Structural array equality; the result lands on the integer stack.
macro_rules! typed_array_eq {
    ($as_fn:ident, $eq:ident) => {
        pub fn $eq(co: &mut Coroutine) -> Result<(), &'static str> {
            let rhs = co.pop_object();
            let lhs = co.pop_object();
            let rhs = $as_fn(&rhs)?;
            let lhs = $as_fn(&lhs)?;
            let equal = *lhs.borrow() == *rhs.borrow();
            co.int_stack.push(equal as i32);
            Ok(())
        }
    };
}

typed_array_eq!(as_ints, array_eq_int);
typed_array_eq!(as_floats, array_eq_float);
typed_array_eq!(as_strs, array_eq_str);

/// Object arrays compare element-wise by reference identity.
pub fn array_eq_obj(co: &mut Coroutine) -> Result<(), &'static str> {
    let rhs = co.pop_object();
    let lhs = co.pop_object();
    let rhs = as_objs(&rhs)?;
    let lhs = as_objs(&lhs)?;
    let equal = obj_array_eq(&lhs.borrow(), &rhs.borrow());
    co.int_stack.push(equal as i32);
    Ok(())
}
