use alloy_sol_types::sol;

sol! {
    #[derive(Debug, PartialEq, Eq)]
    interface SaleContract {
        function balanceOf(address account) external view returns (uint256);
        function calculateRewards(address user) external view returns (uint256);
        function getUserHoldings(address user) external view returns (
            uint256 lockedAmount,
            uint256 earnedRewards,
            uint256 totalBalance,
            uint256 pendingRewards,
            uint256 lockEnd,
            bool isLocked
        );
        function buyTokens(uint256 usdtAmount) external;
        function buyTokensWithReferral(uint256 usdtAmount, address referrer) external;
        function buyTokensWithBNB() external payable;
        function buyTokensWithBNBAndReferral(address referrer) external payable;
        function sellTokens(uint256 amount) external;
        function claimRewards() external;
        function getReferralInfo(address user) external view returns (
            address referrer,
            uint256 totalEarnings,
            uint256 count,
            uint256 totalVolume
        );
        function hasReferrer(address user) external view returns (bool);
        function bnbToUsdtRate() external view returns (uint256);
    }

    #[derive(Debug, PartialEq, Eq)]
    interface Stablecoin {
        function balanceOf(address account) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
        function approve(address spender, uint256 amount) external returns (bool);
    }
}
