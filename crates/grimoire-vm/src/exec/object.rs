//! Object instructions: field access and write-through references.

use crate::coroutine::Coroutine;
use crate::object::{InstanceRef, Obj, SlotRef};

use super::NULL_ERROR;

fn as_instance(obj: &Obj) -> Result<InstanceRef, &'static str> {
    match obj {
        Obj::Instance(inst) => Ok(inst.clone()),
        _ => Err(NULL_ERROR),
    }
}

macro_rules! typed_field_ops {
    ($field:ident, $stack:ident, $pop:ident, $load:ident, $store:ident) => {
        pub fn $load(co: &mut Coroutine, field: usize) -> Result<(), &'static str> {
            let obj = co.pop_object();
            let inst = as_instance(&obj)?;
            let v = inst.borrow().$field.get(field).cloned().unwrap_or_default();
            co.$stack.push(v);
            Ok(())
        }

        pub fn $store(co: &mut Coroutine, field: usize) -> Result<(), &'static str> {
            let obj = co.pop_object();
            let inst = as_instance(&obj)?;
            let v = co.$pop();
            if let Some(slot) = inst.borrow_mut().$field.get_mut(field) {
                *slot = v;
            }
            Ok(())
        }
    };
}

typed_field_ops!(ints, int_stack, pop_int, field_load_int, field_store_int);
typed_field_ops!(floats, float_stack, pop_float, field_load_float, field_store_float);
typed_field_ops!(strs, string_stack, pop_string, field_load_str, field_store_str);
typed_field_ops!(objs, object_stack, pop_object, field_load_obj, field_store_obj);

macro_rules! typed_ref_store {
    ($slot:ident, $pop:ident, $name:ident) => {
        pub fn $name(co: &mut Coroutine) -> Result<(), &'static str> {
            let target = co.pop_object();
            let v = co.$pop();
            match target {
                Obj::Slot(SlotRef::$slot(arr, i)) => {
                    if let Some(slot) = arr.borrow_mut().get_mut(i) {
                        *slot = v;
                    }
                    Ok(())
                }
                _ => Err(NULL_ERROR),
            }
        }
    };
}

typed_ref_store!(Int, pop_int, ref_store_int);
typed_ref_store!(Float, pop_float, ref_store_float);
typed_ref_store!(Str, pop_string, ref_store_str);
typed_ref_store!(Obj, pop_object, ref_store_obj);
