//! Enzyme vault, comptroller and ERC-20 bindings.
//!
//! Only the functions the dashboard calls are declared.

use alloy_sol_types::sol;

sol! {
    /// Enzyme vault proxy. Shares are an ERC-20 on the vault itself.
    interface IEnzymeVault {
        /// Returns the comptroller (accessor) of the vault
        function getAccessor() external view returns (address);

        /// Returns share balance of account
        function balanceOf(address account) external view returns (uint256);
    }

    /// Enzyme comptroller: entry point for buying and redeeming shares.
    interface IEnzymeComptroller {
        /// Deposit denomination asset and receive shares
        function buyShares(uint256 _investmentAmount, uint256 _minSharesQuantity) external returns (uint256);

        /// Burn shares and receive the listed assets in the given proportions (basis points)
        function redeemSharesForSpecificAssets(
            address _recipient,
            uint256 _sharesQuantity,
            address[] _payoutAssets,
            uint256[] _payoutAssetPercentages
        ) external returns (address[], uint256[]);
    }

    /// Denomination asset (USDC).
    interface IERC20 {
        /// Approves spender
        function approve(address spender, uint256 amount) external returns (bool);

        /// Returns token balance of account
        function balanceOf(address account) external view returns (uint256);
    }
}

/// Payout percentage for a single-asset redemption (100% in basis points).
pub const FULL_PAYOUT_BPS: u64 = 10_000;
