/// The operation identifiers used in Milk bytecode
///
/// Operand layouts are noted alongside each operation, see [Instruction](crate::Instruction)
/// for the word encoding. `R(x)` is register x of the current frame, `K(x)` is constant x,
/// `RK(x)` selects a register or a constant depending on the operand's high bit,
/// `U[x]` is upvalue x, and `G` is the globals table of the executing closure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Op {
    /// `A B` — `R(A) := R(B)`
    Move,
    /// `A B C` — `R(A) := R(B)`, then executes the following C MOVE instructions in one dispatch
    MoveN,
    /// `A Bx` — `R(A) := K(Bx)`
    LoadK,
    /// `A B C` — `R(A) := bool(B)`; if C is non-zero the next instruction is skipped
    LoadBool,
    /// `A B` — `R(A) := ... := R(B) := nil`
    LoadNil,
    /// `A B` — `R(A) := U[B]`
    GetUpval,
    /// `A Bx` — `R(A) := G[K(Bx)]`, following the `__index` chain
    GetGlobal,
    /// `A B C` — `R(A) := R(B)[RK(C)]`
    GetTable,
    /// `A B C` — `R(A) := R(B)[RK(C)]`, where RK(C) is a constant string
    GetTableKs,
    /// `A Bx` — `G[K(Bx)] := R(A)`, following the `__newindex` chain
    SetGlobal,
    /// `A B` — `U[B] := R(A)`
    SetUpval,
    /// `A B C` — `R(A)[RK(B)] := RK(C)`
    SetTable,
    /// `A B C` — `R(A)[RK(B)] := RK(C)`, where RK(B) is a constant string
    SetTableKs,
    /// `A B C` — `R(A) := {}`, sized for B array elements and C hash entries
    NewTable,
    /// `A B C` — `R(A + 1) := R(B); R(A) := R(B)[RK(C)]`
    SelfOp,
    /// `A B C` — `R(A) := RK(B) + RK(C)`
    Add,
    /// `A B C` — `R(A) := RK(B) - RK(C)`
    Sub,
    /// `A B C` — `R(A) := RK(B) * RK(C)`
    Mul,
    /// `A B C` — `R(A) := RK(B) / RK(C)`
    Div,
    /// `A B C` — `R(A) := RK(B) % RK(C)` (floored modulo)
    Mod,
    /// `A B C` — `R(A) := RK(B) ^ RK(C)`
    Pow,
    /// `A B` — `R(A) := -R(B)`
    Unm,
    /// `A B` — `R(A) := not R(B)`
    Not,
    /// `A B` — `R(A) := length of R(B)`
    Len,
    /// `A B C` — `R(A) := R(B) .. ... .. R(C)`
    Concat,
    /// `sBx` — `pc += sBx`
    Jmp,
    /// `A B C` — `if (RK(B) == RK(C)) != bool(A) then pc++`
    Eq,
    /// `A B C` — `if (RK(B) < RK(C)) != bool(A) then pc++`
    Lt,
    /// `A B C` — `if (RK(B) <= RK(C)) != bool(A) then pc++`
    Le,
    /// `A C` — `if truthy(R(A)) != bool(C) then pc++`
    Test,
    /// `A B C` — `if truthy(R(B)) == bool(C) then R(A) := R(B) else pc++`
    TestSet,
    /// `A B C` — `R(A) ... R(A+C-2) := R(A)(R(A+1) ... R(A+B-1))`
    Call,
    /// `A B` — `return R(A)(R(A+1) ... R(A+B-1))`, reusing the current frame
    TailCall,
    /// `A B` — `return R(A) ... R(A+B-2)`; B = 0 returns through the register top
    Return,
    /// `A sBx` — `R(A) += R(A+2); if R(A) <?= R(A+1) then { pc += sBx; R(A+3) := R(A) }`
    ForLoop,
    /// `A sBx` — `R(A) -= R(A+2); pc += sBx`
    ForPrep,
    /// `A C` — `R(A+3) ... R(A+2+C) := R(A)(R(A+1), R(A+2))`; exits the loop when R(A+3) is nil
    TForLoop,
    /// `A B C` — `R(A)[(C-1)*50 + i] := R(A+i)` for `1 <= i <= B`; C = 0 reads C from the next word
    SetList,
    /// `A` — close all open upvalues at stack positions >= R(A)
    Close,
    /// `A Bx` — `R(A) := closure(proto Bx)`, binding upvalues from the following pseudo-instructions
    Closure,
    /// `A B` — `R(A) ... R(A+B-2) := vararg`; B = 0 copies all varargs and sets the top
    Vararg,
    /// `A B C` — `R(A) := RK(B) & RK(C)`
    BAnd,
    /// `A B C` — `R(A) := RK(B) | RK(C)`
    BOr,
    /// `A B C` — `R(A) := RK(B) << RK(C)`
    Shl,
    /// `A B C` — `R(A) := RK(B) >> RK(C)`
    Shr,
    /// `A B C` — `R(A) := R(B)` if R(B)'s type tag equals RK(C), otherwise raises
    TypeAssert,
    /// No operation
    Nop,
}

impl Op {
    /// The number of defined operations
    pub const COUNT: u8 = Op::Nop as u8 + 1;

    /// Returns the operation encoded by the given opcode byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        use Op::*;
        let result = match byte {
            0 => Move,
            1 => MoveN,
            2 => LoadK,
            3 => LoadBool,
            4 => LoadNil,
            5 => GetUpval,
            6 => GetGlobal,
            7 => GetTable,
            8 => GetTableKs,
            9 => SetGlobal,
            10 => SetUpval,
            11 => SetTable,
            12 => SetTableKs,
            13 => NewTable,
            14 => SelfOp,
            15 => Add,
            16 => Sub,
            17 => Mul,
            18 => Div,
            19 => Mod,
            20 => Pow,
            21 => Unm,
            22 => Not,
            23 => Len,
            24 => Concat,
            25 => Jmp,
            26 => Eq,
            27 => Lt,
            28 => Le,
            29 => Test,
            30 => TestSet,
            31 => Call,
            32 => TailCall,
            33 => Return,
            34 => ForLoop,
            35 => ForPrep,
            36 => TForLoop,
            37 => SetList,
            38 => Close,
            39 => Closure,
            40 => Vararg,
            41 => BAnd,
            42 => BOr,
            43 => Shl,
            44 => Shr,
            45 => TypeAssert,
            46 => Nop,
            _ => return None,
        };
        Some(result)
    }

    /// The operation's display name
    pub fn name(&self) -> &'static str {
        use Op::*;
        match self {
            Move => "MOVE",
            MoveN => "MOVEN",
            LoadK => "LOADK",
            LoadBool => "LOADBOOL",
            LoadNil => "LOADNIL",
            GetUpval => "GETUPVAL",
            GetGlobal => "GETGLOBAL",
            GetTable => "GETTABLE",
            GetTableKs => "GETTABLEKS",
            SetGlobal => "SETGLOBAL",
            SetUpval => "SETUPVAL",
            SetTable => "SETTABLE",
            SetTableKs => "SETTABLEKS",
            NewTable => "NEWTABLE",
            SelfOp => "SELF",
            Add => "ADD",
            Sub => "SUB",
            Mul => "MUL",
            Div => "DIV",
            Mod => "MOD",
            Pow => "POW",
            Unm => "UNM",
            Not => "NOT",
            Len => "LEN",
            Concat => "CONCAT",
            Jmp => "JMP",
            Eq => "EQ",
            Lt => "LT",
            Le => "LE",
            Test => "TEST",
            TestSet => "TESTSET",
            Call => "CALL",
            TailCall => "TAILCALL",
            Return => "RETURN",
            ForLoop => "FORLOOP",
            ForPrep => "FORPREP",
            TForLoop => "TFORLOOP",
            SetList => "SETLIST",
            Close => "CLOSE",
            Closure => "CLOSURE",
            Vararg => "VARARG",
            BAnd => "BAND",
            BOr => "BOR",
            Shl => "SHL",
            Shr => "SHR",
            TypeAssert => "TYPEASSERT",
            Nop => "NOP",
        }
    }

    /// True for operations whose wide operand is a signed jump offset
    pub fn has_signed_offset(&self) -> bool {
        matches!(self, Op::Jmp | Op::ForLoop | Op::ForPrep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_round_trip() {
        for byte in 0..Op::COUNT {
            let op = Op::from_byte(byte).unwrap();
            assert_eq!(op as u8, byte);
        }
        assert_eq!(Op::from_byte(Op::COUNT), None);
        assert_eq!(Op::from_byte(0x3f), None);
    }
}
