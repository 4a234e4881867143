//! Fungible token balances and allowances held by the source ledger

use crate::error::{BridgeError, BridgeResult};

use alloy_primitives::Address;
use std::collections::HashMap;

/// Balance and allowance book for every token on the source ledger
#[derive(Debug, Default, Clone)]
pub struct TokenBook {
    /// (asset, owner) -> balance
    balances: HashMap<(Address, Address), u128>,
    /// (asset, owner, spender) -> allowance
    allowances: HashMap<(Address, Address, Address), u128>,
}

impl TokenBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance_of(&self, asset: Address, owner: Address) -> u128 {
        self.balances.get(&(asset, owner)).copied().unwrap_or(0)
    }

    pub fn allowance(&self, asset: Address, owner: Address, spender: Address) -> u128 {
        self.allowances
            .get(&(asset, owner, spender))
            .copied()
            .unwrap_or(0)
    }

    /// Credit new supply to an account
    pub fn mint(&mut self, asset: Address, to: Address, amount: u128) -> BridgeResult<()> {
        let balance = self.balances.entry((asset, to)).or_insert(0);
        *balance = balance
            .checked_add(amount)
            .ok_or_else(|| BridgeError::Internal(format!("balance overflow minting {}", asset)))?;
        Ok(())
    }

    pub fn approve(&mut self, asset: Address, owner: Address, spender: Address, amount: u128) {
        self.allowances.insert((asset, owner, spender), amount);
    }

    /// Move tokens owned by `from`
    pub fn transfer(
        &mut self,
        asset: Address,
        from: Address,
        to: Address,
        amount: u128,
    ) -> BridgeResult<()> {
        let have = self.balance_of(asset, from);
        if have < amount {
            return Err(BridgeError::InsufficientFunds {
                asset,
                account: from.to_string(),
                have,
                need: amount,
            });
        }
        if from == to {
            return Ok(());
        }
        let credited = self
            .balance_of(asset, to)
            .checked_add(amount)
            .ok_or_else(|| BridgeError::Internal(format!("balance overflow on {}", asset)))?;

        // All checks passed; apply both legs.
        self.balances.insert((asset, from), have - amount);
        self.balances.insert((asset, to), credited);
        Ok(())
    }

    /// Move tokens on behalf of `from`, consuming `spender`'s allowance
    pub fn transfer_from(
        &mut self,
        asset: Address,
        spender: Address,
        from: Address,
        to: Address,
        amount: u128,
    ) -> BridgeResult<()> {
        let allowance = self.allowance(asset, from, spender);
        if allowance < amount {
            return Err(BridgeError::InsufficientAuthorization {
                account: from,
                asset,
                allowance,
                balance: self.balance_of(asset, from),
                need: amount,
            });
        }
        self.transfer(asset, from, to, amount)?;
        self.allowances
            .insert((asset, from, spender), allowance - amount);
        Ok(())
    }
}
