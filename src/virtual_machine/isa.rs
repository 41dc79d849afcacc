//! Instruction Set Architecture (ISA) definitions.
//!
//! The [`for_each_instruction!`](crate::for_each_instruction) macro holds the
//! canonical opcode table and invokes a callback macro for code generation, so
//! the decoder, the dispatcher, the image builder and the static ISA check all
//! derive from one list.
//!
//! This module generates:
//! - The [`Opcode`] enum with its wire numbering
//! - `TryFrom<u8>` for decoding opcode bytes
//! - [`Opcode::mnemonic`] and [`Opcode::has_operand`]
//!
//! # Bytecode Format
//!
//! An instruction is one opcode byte. Opcodes that carry an operand are
//! followed by a length byte `n` (0..=8) and `n` little-endian bytes holding
//! the operand Word, zero-extended. `n = 0` encodes the value 0.
//!
//! # Stack notation
//!
//! `[a, b] -> [c]` lists stack slots bottom to top: `b` is the top before
//! execution, `c` the top after.

use crate::virtual_machine::errors::VmError;

/// Invokes a callback macro with the complete instruction definition list.
///
/// This macro enables code generation for instructions in multiple modules
/// without duplicating the instruction definitions.
#[macro_export]
macro_rules! for_each_instruction {
    ($callback:ident) => {
        $callback! {
            // =========================
            // Stack and pool memory
            // =========================
            /// NOP ; does nothing
            Nop = 0x00, "NOP" => [],
            /// PUSH imm ; [] -> [imm]
            Push = 0x01, "PUSH" => [value: Imm],
            /// POP ; [a] -> []
            Pop = 0x02, "POP" => [],
            /// LOAD offset ; [width] -> [pool[offset..offset+width]]
            Load = 0x03, "LOAD" => [offset: Offset],
            /// STORE offset ; [value, width] -> [] ; pool[offset..offset+width] = value
            Store = 0x04, "STORE" => [offset: Offset],
            /// MALLOC_POOL key ; allocates the size recorded for key and makes it the current pool
            MallocPool = 0x05, "MALLOC_POOL" => [key: Key],
            /// FREE_POOL ; releases and pops the current pool
            FreePool = 0x06, "FREE_POOL" => [],
            /// PUSH_PTR offset ; [] -> [pool + offset]
            PushPtr = 0x07, "PUSH_PTR" => [offset: Offset],
            /// LOAD_PTR width ; [addr] -> [*addr]
            LoadPtr = 0x08, "LOAD_PTR" => [width: Width],
            /// STORE_PTR width ; [addr, value] -> [] ; *addr = value
            StorePtr = 0x09, "STORE_PTR" => [width: Width],
            /// DUP k ; duplicates the k-th element below the top
            Dup = 0x0A, "DUP" => [depth: Depth],
            /// PUSH_ARRAY ; [size] -> [addr]
            PushArray = 0x0B, "PUSH_ARRAY" => [],
            /// LOAD_ARRAY width ; [base, index] -> [*(base + index)]
            LoadArray = 0x0C, "LOAD_ARRAY" => [width: Width],
            /// STORE_ARRAY width ; [base, index, value] -> [] ; *(base + index) = value
            StoreArray = 0x0D, "STORE_ARRAY" => [width: Width],
            // =========================
            // Arithmetic (signed / float / unsigned)
            // =========================
            /// IADD ; [a, b] -> [a + b]
            IAdd = 0x0E, "IADD" => [],
            /// FADD ; [a, b] -> [a + b]
            FAdd = 0x0F, "FADD" => [],
            /// UADD ; [a, b] -> [a + b]
            UAdd = 0x10, "UADD" => [],
            /// ISUB ; [a, b] -> [a - b]
            ISub = 0x11, "ISUB" => [],
            /// FSUB ; [a, b] -> [a - b]
            FSub = 0x12, "FSUB" => [],
            /// USUB ; [a, b] -> [a - b]
            USub = 0x13, "USUB" => [],
            /// IMUL ; [a, b] -> [a * b]
            IMul = 0x14, "IMUL" => [],
            /// FMUL ; [a, b] -> [a * b]
            FMul = 0x15, "FMUL" => [],
            /// UMUL ; [a, b] -> [a * b]
            UMul = 0x16, "UMUL" => [],
            /// IDIV ; [a, b] -> [a / b] (trap on division by zero)
            IDiv = 0x17, "IDIV" => [],
            /// FDIV ; [a, b] -> [a / b] (trap on division by zero)
            FDiv = 0x18, "FDIV" => [],
            /// UDIV ; [a, b] -> [a / b] (trap on division by zero)
            UDiv = 0x19, "UDIV" => [],
            /// IMOD ; [a, b] -> [a % b] (trap on division by zero)
            IMod = 0x1A, "IMOD" => [],
            /// FMOD ; [a, b] -> [remainder(a, b)] (IEEE remainder)
            FMod = 0x1B, "FMOD" => [],
            /// UMOD ; [a, b] -> [a % b] (trap on division by zero)
            UMod = 0x1C, "UMOD" => [],
            // =========================
            // Comparison
            // =========================
            /// ILESS ; [a, b] -> [a < b]
            ILess = 0x1D, "ILESS" => [],
            /// FLESS ; [a, b] -> [a < b]
            FLess = 0x1E, "FLESS" => [],
            /// ULESS ; [a, b] -> [a < b]
            ULess = 0x1F, "ULESS" => [],
            /// ILESS_EQUAL ; [a, b] -> [a <= b]
            ILessEqual = 0x20, "ILESS_EQUAL" => [],
            /// FLESS_EQUAL ; [a, b] -> [a <= b]
            FLessEqual = 0x21, "FLESS_EQUAL" => [],
            /// ULESS_EQUAL ; [a, b] -> [a <= b]
            ULessEqual = 0x22, "ULESS_EQUAL" => [],
            /// IGREATER ; [a, b] -> [a > b]
            IGreater = 0x23, "IGREATER" => [],
            /// FGREATER ; [a, b] -> [a > b]
            FGreater = 0x24, "FGREATER" => [],
            /// UGREATER ; [a, b] -> [a > b]
            UGreater = 0x25, "UGREATER" => [],
            /// IGREATER_EQUALS ; [a, b] -> [a >= b]
            IGreaterEquals = 0x26, "IGREATER_EQUALS" => [],
            /// FGREATER_EQUALS ; [a, b] -> [a >= b]
            FGreaterEquals = 0x27, "FGREATER_EQUALS" => [],
            /// UGREATER_EQUALS ; [a, b] -> [a >= b]
            UGreaterEquals = 0x28, "UGREATER_EQUALS" => [],
            /// EQ ; [a, b] -> [a == b] (bitwise)
            Eq = 0x29, "EQ" => [],
            /// NEQ ; [a, b] -> [a != b] (bitwise)
            Neq = 0x2A, "NEQ" => [],
            // =========================
            // Bitwise
            // =========================
            /// AND ; [a, b] -> [a & b]
            And = 0x2B, "AND" => [],
            /// OR ; [a, b] -> [a | b]
            Or = 0x2C, "OR" => [],
            /// XOR ; [a, b] -> [a ^ b]
            Xor = 0x2D, "XOR" => [],
            /// LSHIFT ; [a, b] -> [a << b]
            LShift = 0x2E, "LSHIFT" => [],
            /// RSHIFT ; [a, b] -> [a >> b] (logical)
            RShift = 0x2F, "RSHIFT" => [],
            // =========================
            // Unary
            // =========================
            /// INEG ; [a] -> [-a]
            INeg = 0x31, "INEG" => [],
            /// FNEG ; [a] -> [-a]
            FNeg = 0x32, "FNEG" => [],
            /// UNEG ; [a] -> [-a] (two's complement)
            UNeg = 0x33, "UNEG" => [],
            /// NOT ; [a] -> [a == 0]
            Not = 0x34, "NOT" => [],
            /// ONES ; [a] -> [!a] (bitwise complement)
            Ones = 0x35, "ONES" => [],
            // =========================
            // Control flow
            // =========================
            /// INT code ; invokes interrupt handler `code`
            Int = 0x36, "INT" => [code: Code],
            /// JMP target ; pc = target
            Jmp = 0x37, "JMP" => [target: Target],
            /// JMP_ZERO target ; [c] -> [] ; if c == 0 then pc = target
            JmpZero = 0x38, "JMP_ZERO" => [target: Target],
            /// JMP_NOT_ZERO target ; [c] -> [] ; if c != 0 then pc = target
            JmpNotZero = 0x39, "JMP_NOT_ZERO" => [target: Target],
            /// CALL target ; [] -> [module, return] ; pc = target
            Call = 0x3A, "CALL" => [target: Target],
            /// VCALL ; [module, target] -> [caller_module, return] ; switches module
            VCall = 0x3B, "VCALL" => [],
            /// RET ; [module, return] -> [] ; resumes in module at return
            Ret = 0x3C, "RET" => [],
            // =========================
            // Casts
            // =========================
            /// ITU ; signed -> unsigned (bits kept)
            Itu = 0x3D, "ITU" => [],
            /// ITF ; signed -> float
            Itf = 0x3E, "ITF" => [],
            /// FTI ; float -> signed (saturating)
            Fti = 0x3F, "FTI" => [],
            /// FTU ; float -> unsigned (saturating)
            Ftu = 0x40, "FTU" => [],
            /// UTI ; unsigned -> signed (bits kept)
            Uti = 0x41, "UTI" => [],
            /// UTF ; unsigned -> float
            Utf = 0x42, "UTF" => [],
            // =========================
            // Module memory
            // =========================
            /// LOAD_MEMORY offset ; [] -> [memory + offset]
            LoadMemory = 0x43, "LOAD_MEMORY" => [offset: Offset],
        }
    };
}

#[macro_export]
macro_rules! define_instructions {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $opcode:expr, $mnemonic:literal => [
                $( $field:ident : $kind:ident ),* $(,)?
            ]
        ),* $(,)?
    ) => {
        // =========================
        // VM opcode enum
        // =========================
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $(
                $(#[$doc])*
                $name = $opcode,
            )*
        }

        impl TryFrom<u8> for Opcode {
            type Error = VmError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $( $opcode => Ok(Opcode::$name), )*
                    _ => Err(VmError::IllegalOpcode { opcode: value }),
                }
            }
        }

        impl Opcode {
            /// Every opcode in wire order.
            pub const ALL: &'static [Opcode] = &[ $( Opcode::$name, )* ];

            /// Returns the assembly mnemonic for this instruction.
            pub const fn mnemonic(&self) -> &'static str {
                match self {
                    $( Opcode::$name => $mnemonic, )*
                }
            }

            /// Returns true if the instruction is followed by an operand.
            pub const fn has_operand(&self) -> bool {
                match self {
                    $( Opcode::$name => $crate::define_instructions!(@has $($field)*), )*
                }
            }

            /// Returns the name of the operand, if any.
            pub const fn operand_name(&self) -> Option<&'static str> {
                match self {
                    $( Opcode::$name => $crate::define_instructions!(@name $($field)*), )*
                }
            }

            /// Looks an opcode up by mnemonic.
            pub fn from_mnemonic(mnemonic: &str) -> Option<Opcode> {
                match mnemonic {
                    $( $mnemonic => Some(Opcode::$name), )*
                    _ => None,
                }
            }
        }
    };

    (@has) => { false };
    (@has $field:ident) => { true };

    (@name) => { None };
    (@name $field:ident) => { Some(stringify!($field)) };
}

for_each_instruction!(define_instructions);

/// Returns true if `opcode` is followed by an operand in the byte stream.
///
/// Unassigned opcode bytes carry no operand; they are rejected when executed,
/// not when loaded.
pub fn has_operand(opcode: u8) -> bool {
    Opcode::try_from(opcode)
        .map(|op| op.has_operand())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_try_from_invalid() {
        assert!(matches!(
            Opcode::try_from(0x30),
            Err(VmError::IllegalOpcode { opcode: 0x30 })
        ));
        assert!(matches!(
            Opcode::try_from(0xFF),
            Err(VmError::IllegalOpcode { opcode: 0xFF })
        ));
    }

    #[test]
    fn opcode_round_trips_through_byte() {
        for op in Opcode::ALL {
            assert_eq!(Opcode::try_from(*op as u8).unwrap(), *op);
        }
        assert_eq!(Opcode::ALL.len(), 67);
    }

    #[test]
    fn operand_carriers() {
        let carriers: Vec<&str> = Opcode::ALL
            .iter()
            .filter(|op| op.has_operand())
            .map(|op| op.mnemonic())
            .collect();
        assert_eq!(
            carriers,
            vec![
                "PUSH",
                "LOAD",
                "STORE",
                "MALLOC_POOL",
                "PUSH_PTR",
                "LOAD_PTR",
                "STORE_PTR",
                "DUP",
                "LOAD_ARRAY",
                "STORE_ARRAY",
                "INT",
                "JMP",
                "JMP_ZERO",
                "JMP_NOT_ZERO",
                "CALL",
                "LOAD_MEMORY",
            ]
        );
    }

    #[test]
    fn unknown_opcode_has_no_operand() {
        assert!(!has_operand(0x30));
        assert!(!has_operand(0xEE));
        assert!(has_operand(Opcode::Push as u8));
    }

    #[test]
    fn mnemonic_lookup() {
        assert_eq!(Opcode::from_mnemonic("VCALL"), Some(Opcode::VCall));
        assert_eq!(Opcode::from_mnemonic("vcall"), None);
        assert_eq!(Opcode::Dup.operand_name(), Some("depth"));
        assert_eq!(Opcode::Ret.operand_name(), None);
    }
}
